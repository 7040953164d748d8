use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use wormgate::config::{default_override_path, Config};
use wormgate::controller::ControlServer;
use wormgate::pipeline::ProxyPipeline;
use wormgate::pool::{ConnectionPool, PoolConfig};
use wormgate::proxy::ProxyServer;
use wormgate::registry::{sweep_loop, HostRegistry};
use wormgate::{PKG_NAME, VERSION};

/// Config file read from the working directory when no path is given
const DEFAULT_CONFIG_FILE: &str = "wormgate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wormgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration: explicit path, else ./wormgate.toml if present, else defaults.
    // The per-user override file is merged on top in every case.
    let config_path = std::env::args().nth(1).map(PathBuf::from).or_else(|| {
        let path = PathBuf::from(DEFAULT_CONFIG_FILE);
        path.exists().then_some(path)
    });
    let override_path = default_override_path();

    let config = Config::load_layered(config_path.as_deref(), override_path.as_deref()).map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        path = ?config_path.as_ref().map(|p| p.display().to_string()),
        override_path = ?override_path.as_ref().filter(|p| p.exists()).map(|p| p.display().to_string()),
        "Configuration loaded"
    );

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = HostRegistry::new(config.hosts.clone());

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let pipeline = Arc::new(ProxyPipeline::new(
        Arc::clone(&registry),
        config.proxy.clone(),
        Arc::new(ConnectionPool::new(pool_config)),
    ));
    let pool_stats = pipeline.pool().stats();

    // Spawn expiry sweep task
    let sweep_handle = tokio::spawn(sweep_loop(Arc::clone(&registry), shutdown_rx.clone()));

    // Create HTTP proxy server (if port > 0)
    let proxy_handle = if config.server.port > 0 {
        let proxy_addr = parse_addr(&config.server.bind, config.server.port, "proxy")?;
        let proxy = ProxyServer::new(proxy_addr, pipeline, shutdown_rx.clone());

        Some(tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(error = %e, "Proxy server error");
            }
        }))
    } else {
        info!("Proxy front end disabled (port = 0)");
        None
    };

    // Create control server
    let controller_addr = parse_addr(&config.server.controller_bind, config.server.controller_port, "controller")?;
    let controller = ControlServer::new(controller_addr, Arc::clone(&registry), shutdown_rx.clone());

    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!(error = %e, "Control server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = proxy_handle {
            let _ = handle.await;
        }
        let _ = controller_handle.await;
        let _ = sweep_handle.await;
    })
    .await;

    info!(
        hosts = registry.len(),
        total_requests = pool_stats.get_total_requests(),
        failed_requests = pool_stats.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

fn parse_addr(bind: &str, port: u16, what: &str) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind = %bind, port, error = %e, "Invalid {} bind address", what);
        anyhow::anyhow!("Invalid {} bind address: {}", what, e)
    })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting tunnel endpoint");
    info!(
        bind = %config.server.bind,
        port = if config.server.port > 0 { Some(config.server.port) } else { None },
        controller_bind = %config.server.controller_bind,
        controller_port = config.server.controller_port,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        domain_prefix = %config.hosts.domain_prefix,
        domain_suffix = %config.hosts.domain_suffix,
        port_range_start = config.hosts.port_range_start,
        port_range_end = config.hosts.port_range_end,
        name_length = config.hosts.name_length,
        "Host settings"
    );
    info!(
        timeout_secs = config.hosts.timeout_secs,
        sweep_interval_secs = config.hosts.sweep_interval_secs,
        "Lease settings"
    );
    info!(
        forward_client_ip = config.proxy.forward_client_ip,
        forward_fragment = config.proxy.forward_fragment,
        "Proxy settings"
    );
}
