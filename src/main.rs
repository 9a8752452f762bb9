use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mc_logstream::app::{Config, EventSinks};
use mc_logstream::stream::{self, LogClient, LogServer};

/// Stream a Minecraft server log to remote listeners
#[derive(Parser)]
#[command(name = "mc-logstream")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); defaults to the config value
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Write diagnostics to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Config file (defaults to ~/.config/mc-logstream/config.toml)
    #[arg(short, long, global = true, env = "MC_LOGSTREAM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the server log and stream it to connected clients
    Serve {
        /// Log file to tail
        #[arg(long)]
        log_path: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Connect to a log server and print classified events
    Listen {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Open a short diagnostic connection and report the first record
    Probe {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_default(),
    };

    let level = cli.log_level.as_deref().unwrap_or(config.log_level.as_str());
    init_logging(level, cli.log_file.as_deref())?;

    let runtime = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Serve {
            log_path,
            host,
            port,
        } => {
            let mut server_config = config.to_server_config();
            if let Some(log_path) = log_path {
                server_config.log_path = log_path;
            }
            if let Some(host) = host {
                server_config.host = host;
            }
            if let Some(port) = port {
                server_config.port = port;
            }
            runtime.block_on(serve(server_config))
        }
        Commands::Listen { host, port } => {
            let mut client_config = config.to_client_config();
            if let Some(host) = host {
                client_config.host = host;
            }
            if let Some(port) = port {
                client_config.port = port;
            }
            runtime.block_on(listen(client_config))
        }
        Commands::Probe { host, port } => {
            let host = host.unwrap_or_else(|| config.client.host.clone());
            let port = port.unwrap_or(config.client.port);
            let probe_config = config.to_probe_config();
            runtime.block_on(async {
                let report = stream::probe(&host, port, &probe_config)
                    .await
                    .with_context(|| format!("Probe of {}:{} failed", host, port))?;
                println!("{}", report);
                Ok(())
            })
        }
    }
}

fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false),
                )
                .init();
        }
        None => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}

/// Resolve on Ctrl-C; never resolves if the handler cannot be installed
async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received, shutting down"),
        Err(e) => {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

async fn serve(config: stream::ServerConfig) -> Result<()> {
    let server = LogServer::bind(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server_task = tokio::spawn(server.run(shutdown_rx));

    tokio::select! {
        result = &mut server_task => return result.context("Server task failed")?,
        _ = interrupted() => {}
    }

    shutdown_tx.send_replace(true);
    server_task.await.context("Server task failed")?
}

async fn listen(config: stream::ClientConfig) -> Result<()> {
    let client = LogClient::new(config, logging_sinks());
    let stop = client.stop_handle();
    let mut client_task = tokio::spawn(client.run());

    let state = tokio::select! {
        state = &mut client_task => state,
        _ = interrupted() => {
            stop.stop();
            client_task.await
        }
    }
    .context("Client task failed")?;

    info!(
        "Listener finished after spending {} connection attempts",
        state.spent_attempts
    );
    Ok(())
}

fn logging_sinks() -> EventSinks {
    EventSinks::new()
        .with_chat(|player: &str, message: &str| -> Result<()> {
            info!("<{}> {}", player, message);
            Ok(())
        })
        .with_join(|player: &str| -> Result<()> {
            info!("{} joined", player);
            Ok(())
        })
        .with_leave(|player: &str| -> Result<()> {
            info!("{} left", player);
            Ok(())
        })
        .with_advancement(|player: &str, advancement: &str| -> Result<()> {
            info!("{} earned [{}]", player, advancement);
            Ok(())
        })
        .with_death(|_player: &str, reason: &str| -> Result<()> {
            info!("{}", reason);
            Ok(())
        })
        .with_disconnected(|reason: &str| -> Result<()> {
            warn!("Connection lost: {}", reason);
            Ok(())
        })
        .with_reconnected(|| -> Result<()> {
            info!("Connection restored");
            Ok(())
        })
}
