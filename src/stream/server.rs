//! Broadcast server: tails the log file and streams every new line to all
//! connected clients

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{write_message, Frame, WireMessage, WireReader};
use super::registry::{ConnectionRegistry, DEFAULT_QUEUE_CAPACITY};
use crate::logwatch::{Tailer, TailerConfig};

/// Depth of the channel between the tailer and the broadcast loop
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port to listen on; 0 picks a free port
    pub port: u16,
    /// Log file to tail, usually `logs/latest.log` of the game server
    pub log_path: PathBuf,
    /// Period of the heartbeat sweep
    pub heartbeat_interval: Duration,
    /// Idle time after which a client is dropped
    pub client_timeout: Duration,
    /// Upper bound for a single outbound write
    pub write_timeout: Duration,
    /// Depth of each connection's outbound queue
    pub queue_capacity: usize,
    pub tailer: TailerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: super::DEFAULT_HOST.to_string(),
            port: super::DEFAULT_PORT,
            log_path: PathBuf::from("logs/latest.log"),
            heartbeat_interval: Duration::from_secs(10),
            client_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tailer: TailerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A bound log server, ready to run
#[derive(Debug)]
pub struct LogServer {
    config: ServerConfig,
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
}

impl LogServer {
    /// Check the log file and bind the listener
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        if !config.log_path.is_file() {
            bail!("Log file not found: {}", config.log_path.display());
        }

        let listener = TcpListener::bind(config.addr())
            .await
            .with_context(|| format!("Failed to bind to {}", config.addr()))?;

        let registry = Arc::new(ConnectionRegistry::new(config.queue_capacity));
        Ok(Self {
            config,
            listener,
            registry,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Serve until `shutdown` flips
    ///
    /// On return the listener is closed and every connection has been
    /// deregistered, which closes its transport.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let LogServer {
            config,
            listener,
            registry,
        } = self;

        info!(
            "Log server listening on {}, streaming {}",
            listener.local_addr().context("Failed to read listener address")?,
            config.log_path.display()
        );

        let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
        let (tailer_stop_tx, tailer_stop_rx) = watch::channel(false);
        let tailer = Tailer::new(&config.log_path, config.tailer.clone()).spawn(line_tx, tailer_stop_rx);

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        heartbeat.tick().await;

        while !*shutdown.borrow() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let (id, outbound) = registry.register(peer);
                        info!("Client {} connected ({} total)", peer, registry.len());
                        tokio::spawn(handle_connection(
                            stream,
                            id,
                            outbound,
                            registry.clone(),
                            config.write_timeout,
                        ));
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                line = line_rx.recv() => match line {
                    Some(line) => {
                        let delivered = registry.broadcast(&WireMessage::log(line));
                        debug!("Broadcast line to {} clients", delivered);
                    }
                    None => {
                        warn!("Tailer stopped unexpectedly, shutting down");
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    registry.sweep(config.client_timeout);
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Log server shutting down");
        drop(listener);
        let _ = tailer_stop_tx.send(true);
        if let Err(e) = tailer.await {
            warn!("Tailer task failed: {}", e);
        }
        let closed = registry.clear();
        info!("Closed {} client connections", closed);
        Ok(())
    }
}

/// Drive one client: drain its outbound queue and read its replies
async fn handle_connection(
    stream: TcpStream,
    id: Uuid,
    mut outbound: mpsc::Receiver<WireMessage>,
    registry: Arc<ConnectionRegistry>,
    write_timeout: Duration,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = WireReader::new(read_half);

    let reason = loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(message) => {
                    match tokio::time::timeout(write_timeout, write_message(&mut write_half, &message)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => break format!("write failed: {:#}", e),
                        Err(_) => break format!("write timed out after {:?}", write_timeout),
                    }
                }
                // Entry already removed by broadcast, sweep or shutdown
                None => break "deregistered".to_string(),
            },
            frame = reader.next_frame() => match frame {
                Ok(Some(Frame::Message(message))) => {
                    registry.touch(&id);
                    debug!("Client {} sent {}", id, message.kind());
                }
                Ok(Some(Frame::Malformed(reason))) => {
                    warn!("Skipping malformed record from client {}: {}", id, reason);
                }
                Ok(None) => break "closed by peer".to_string(),
                Err(e) => break format!("read failed: {}", e),
            },
        }
    };

    registry.remove(&id, &reason);
    let _ = write_half.shutdown().await;
}
