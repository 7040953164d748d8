//! Line-oriented control protocol for managing leases.
//!
//! Each connection carries exactly one command line and gets one response
//! (possibly several lines for `listHosts`), after which the server closes it.
//!
//! | Command                | Response                                      |
//! |------------------------|-----------------------------------------------|
//! | `createHost [name]`    | `<domain>,<name>,<port>` or `error`           |
//! | `keepHostAlive <name>` | `ok` or `Invalid host: <name>`                |
//! | `removeHost <name>`    | `ok` or `Invalid host: <name>`                |
//! | `listHosts`            | `<domain> <port> <created> <expiry>` lines, then `# hosts: <n>` |
//! | anything else          | `Invalid command: <input>`                    |

use crate::registry::HostRegistry;
use chrono::{DateTime, Local, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Longest command line accepted, excluding the newline
const MAX_LINE_LEN: u64 = 4096;

/// Timestamp format used by `listHosts`
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A parsed control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Lease a host, randomly named unless a name is given
    CreateHost(Option<String>),
    KeepHostAlive(String),
    RemoveHost(String),
    ListHosts,
}

impl Command {
    /// Parse a command line. Keywords are case-sensitive.
    pub fn parse(line: &str) -> Option<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        match tokens.as_slice() {
            ["createHost"] => Some(Command::CreateHost(None)),
            ["createHost", name] => Some(Command::CreateHost(Some(name.to_string()))),
            ["keepHostAlive", name] => Some(Command::KeepHostAlive(name.to_string())),
            ["removeHost", name] => Some(Command::RemoveHost(name.to_string())),
            ["listHosts"] => Some(Command::ListHosts),
            _ => None,
        }
    }
}

/// Run one command line against the registry and render the response
pub fn process_command(registry: &HostRegistry, line: &str) -> String {
    let line = line.trim();
    match Command::parse(line) {
        Some(command) => execute(registry, command),
        None => format!("Invalid command: {}", line),
    }
}

fn execute(registry: &HostRegistry, command: Command) -> String {
    match command {
        Command::CreateHost(name) => {
            let result = match name {
                Some(name) => registry.create_named(&name),
                None => registry.create(),
            };
            match result {
                Ok(host) => {
                    info!(name = host.name(), port = host.port(), "Host created");
                    format!("{},{},{}", registry.domain_name(&host), host.name(), host.port())
                }
                Err(e) => {
                    warn!(error = %e, "Failed to create host");
                    "error".to_string()
                }
            }
        }
        Command::KeepHostAlive(name) => match registry.get(&name) {
            Some(host) if host.keep_alive() => "ok".to_string(),
            Some(_) => {
                debug!(name = %name, "Keep-alive for lapsed host");
                invalid_host(&name)
            }
            None => invalid_host(&name),
        },
        Command::RemoveHost(name) => match registry.get(&name) {
            Some(host) if registry.remove(&host) => {
                info!(name = %name, port = host.port(), "Host removed");
                "ok".to_string()
            }
            _ => invalid_host(&name),
        },
        Command::ListHosts => {
            let hosts = registry.list();
            let mut lines: Vec<String> = hosts
                .iter()
                .map(|host| {
                    format!(
                        "{} {} {} {}",
                        registry.domain_name(host),
                        host.port(),
                        format_time(host.create_time()),
                        format_time(host.expiry())
                    )
                })
                .collect();
            lines.push(format!("# hosts: {}", hosts.len()));
            lines.join("\n")
        }
    }
}

fn invalid_host(name: &str) -> String {
    format!("Invalid host: {}", name)
}

fn format_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local).format(TIME_FORMAT).to_string()
}

/// TCP server for the control protocol
pub struct ControlServer {
    bind_addr: SocketAddr,
    registry: Arc<HostRegistry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    pub fn new(bind_addr: SocketAddr, registry: Arc<HostRegistry>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Control server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            tokio::spawn(async move {
                                if let Err(e) = handle_control_connection(stream, registry).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_control_connection(mut stream: TcpStream, registry: Arc<HostRegistry>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.split();

    let response = match read_command(reader).await? {
        Some(line) => {
            debug!(command = %line.trim(), "Control command");
            process_command(&registry, &line)
        }
        None => {
            warn!(limit = MAX_LINE_LEN, "Control command too long");
            "error".to_string()
        }
    };

    writer.write_all(response.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

/// Read one command line. Returns `None` if it runs past `MAX_LINE_LEN`.
async fn read_command<R: AsyncRead + Unpin>(reader: R) -> std::io::Result<Option<String>> {
    let mut reader = BufReader::new(reader.take(MAX_LINE_LEN + 1));

    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).await?;

    if !line.ends_with(b"\n") && line.len() as u64 > MAX_LINE_LEN {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Send one command and return the response lines
pub async fn send_command<A: ToSocketAddrs>(addr: A, command: &str) -> anyhow::Result<Vec<String>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(command.trim().as_bytes()).await?;
    stream.write_all(b"\n").await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response.lines().map(String::from).collect())
}
