//! wormctl - Command-line client for the wormgate control protocol
//!
//! Usage:
//!   wormctl createHost [name]       Lease a host (random name unless given)
//!   wormctl keepHostAlive <name>    Renew a lease
//!   wormctl removeHost <name>       Release a lease and its port
//!   wormctl listHosts               List active leases
//!
//! The controller address defaults to 127.0.0.1:12700 and can be changed
//! with `--addr host:port` or the `WORMGATE_ADDR` environment variable.

use anyhow::{bail, Result};
use std::env;
use wormgate::controller::send_command;
use wormgate::VERSION;

/// Default controller address
const DEFAULT_ADDR: &str = "127.0.0.1:12700";

#[derive(Debug, PartialEq)]
enum Action {
    Help,
    Version,
    Send { addr: String, line: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let default_addr = env::var("WORMGATE_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());

    match parse_args(&args, &default_addr)? {
        Action::Help => print_help(),
        Action::Version => println!("wormctl {}", VERSION),
        Action::Send { addr, line } => {
            for response in send_command(addr.as_str(), &line).await? {
                println!("{}", response);
            }
        }
    }

    Ok(())
}

fn parse_args(args: &[String], default_addr: &str) -> Result<Action> {
    let mut addr = default_addr.to_string();
    let mut words = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Action::Help),
            "-V" | "--version" => return Ok(Action::Version),
            // Bare words only count in command position
            "help" if words.is_empty() => return Ok(Action::Help),
            "version" if words.is_empty() => return Ok(Action::Version),
            "-a" | "--addr" => match iter.next() {
                Some(value) => addr = value.clone(),
                None => bail!("--addr requires a value (host:port)"),
            },
            _ => words.push(arg.as_str()),
        }
    }

    if words.is_empty() {
        return Ok(Action::Help);
    }

    Ok(Action::Send {
        addr,
        line: words.join(" "),
    })
}

fn print_help() {
    println!(r#"
wormctl - Manage host leases on a wormgate server

USAGE:
    wormctl [--addr host:port] <command> [args]

COMMANDS:
    createHost [name]        Lease a host (random name unless given)
    keepHostAlive <name>     Renew a lease
    removeHost <name>        Release a lease and its port
    listHosts                List active leases

OPTIONS:
    -a, --addr <host:port>   Controller address (default: {}, env: WORMGATE_ADDR)
    -h, --help               Show this help
    -V, --version            Show version
"#, DEFAULT_ADDR);
}
