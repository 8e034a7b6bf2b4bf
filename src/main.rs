//! quictun - Entry Point
//!
//! `quictun server` accepts client sessions; `quictun client` connects to a
//! server and runs forwarding rules through the session.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use quictun::client::{Client, QuicConnector};
use quictun::config::{ClientFileConfig, LoggingConfig, ServerFileConfig};
use quictun::server::Server;
use quictun::spec::parse_all;
use quictun::VERSION;

/// TCP/UDP forwarding over a single QUIC session
#[derive(Parser)]
#[command(name = "quictun")]
#[command(version = VERSION)]
#[command(about = "TCP/UDP port forwarding over a multiplexed QUIC session")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel server
    Server(ServerArgs),
    /// Run the tunnel client
    Client(ClientArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address for the QUIC listener
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Allow clients to request reverse listeners
    #[arg(long)]
    reverse: bool,
    /// Allow clients to use this server as a SOCKS5 egress
    #[arg(long)]
    socks5: bool,
    /// Keepalive interval in seconds (0 disables)
    #[arg(long)]
    keepalive: Option<u64>,
    #[command(flatten)]
    log: LogArgs,
}

#[derive(Args)]
struct ClientArgs {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Keepalive interval in seconds (0 disables)
    #[arg(long)]
    keepalive: Option<u64>,
    /// Give up after this many attempts (negative = never)
    #[arg(long, allow_negative_numbers = true)]
    max_retry_count: Option<i64>,
    /// Longest wait between attempts, in seconds
    #[arg(long)]
    max_retry_interval: Option<u64>,
    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,
    /// TLS server name (defaults to the server host)
    #[arg(long)]
    server_name: Option<String>,
    /// Extra CA certificate (PEM) to trust
    #[arg(long)]
    ca: Option<String>,
    /// Server address (host:port)
    server: Option<String>,
    /// Forwarding rules, e.g. `3000:example.com:80` or `R:2222:localhost:22`
    remotes: Vec<String>,
    #[command(flatten)]
    log: LogArgs,
}

#[derive(Args)]
struct LogArgs {
    /// Log level override
    #[arg(long, env = "QUICTUN_LOG_LEVEL")]
    log_level: Option<String>,
    /// Log format: pretty or json
    #[arg(long)]
    log_format: Option<String>,
}

impl LogArgs {
    fn apply(&self, logging: &mut LoggingConfig) {
        if let Some(level) = &self.log_level {
            logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            logging.format = format.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Both rustls and quinn need a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Client(args) => run_client(args).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ServerFileConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ServerFileConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    config.server.reverse |= args.reverse;
    config.server.socks5 |= args.socks5;
    if let Some(keepalive) = args.keepalive {
        config.tunnel.keepalive_secs = keepalive;
    }
    args.log.apply(&mut config.logging);
    config.validate()?;

    quictun::util::init_tracing(&config.logging)?;
    info!(version = VERSION, "Starting quictun server");

    if config.metrics.enabled {
        quictun::metrics::init_metrics(&config.metrics)?;
        info!(bind_addr = %config.metrics.bind_addr, "Metrics endpoint started");
    }

    let policy = Arc::new(config.access.clone());
    let server = Server::new(&config, policy).await?;
    info!(bind_addr = %server.local_addr()?, "Server listening");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "Server error");
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, draining sessions...");
            server.shutdown().await;
        }
    }

    info!("Server stopped");
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ClientFileConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ClientFileConfig::default(),
    };
    if let Some(keepalive) = args.keepalive {
        config.tunnel.keepalive_secs = keepalive;
    }
    if let Some(count) = args.max_retry_count {
        config.reconnect.max_attempts = count;
    }
    if let Some(interval) = args.max_retry_interval {
        config.reconnect.max_backoff_secs = interval;
    }
    config.client.insecure |= args.insecure;
    if args.server_name.is_some() {
        config.client.server_name = args.server_name.clone();
    }
    if args.ca.is_some() {
        config.client.ca_path = args.ca.clone();
    }
    if !args.remotes.is_empty() {
        config.client.remotes = args.remotes.clone();
    }
    args.log.apply(&mut config.logging);
    config.validate()?;

    quictun::util::init_tracing(&config.logging)?;

    let server = args
        .server
        .clone()
        .or_else(|| config.client.server.clone())
        .context("No server address given")?;
    let specs = parse_all(&config.client.remotes).context("Invalid forwarding rule")?;
    if specs.is_empty() {
        anyhow::bail!("At least one forwarding rule is required");
    }
    info!(version = VERSION, %server, rules = specs.len(), "Starting quictun client");

    let connector = QuicConnector::new(&config.client, &server).await?;
    let client = Client::new(
        specs,
        config.tunnel.resolve(),
        config.reconnect.resolve(),
        Arc::new(connector),
    )?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    retry_on_hangup(&client);

    if let Err(e) = client.run(cancel).await {
        error!(error = %e, "Client stopped");
        return Err(e.into());
    }

    info!("Client stopped");
    Ok(())
}

/// SIGHUP skips the remaining reconnect backoff
#[cfg(unix)]
fn retry_on_hangup(client: &Client) {
    if let Err(e) = quictun::reconnect::wake_on_hangup(client.reconnect().waker()) {
        error!(error = %e, "Failed to install SIGHUP handler");
    }
}

#[cfg(not(unix))]
fn retry_on_hangup(_client: &Client) {}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
