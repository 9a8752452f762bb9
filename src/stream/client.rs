//! Reconnecting log stream client
//!
//! [`LogClient`] connects to a log server, answers its heartbeats, classifies
//! every streamed line and hands the resulting events to the registered
//! [`EventSinks`]. [`LogClient::run`] keeps the link up until the client is
//! stopped or the retry budget runs out.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::ClientError;
use super::protocol::{write_message, Frame, WireMessage, WireReader};
use crate::app::events::{EventDispatcher, EventSinks, SinkEvent, DEFAULT_DISPATCH_CAPACITY};
use crate::logwatch::classify;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Bound for a single read; the heartbeat deadline is checked after each
    pub read_timeout: Duration,
    /// Disconnect when no ping arrived for this long
    pub heartbeat_timeout: Duration,
    pub write_timeout: Duration,
    /// Pause between connection attempts; zero disables reconnecting
    pub retry_interval: Duration,
    /// Cap on attempts spent over the client's lifetime (failed connects and
    /// lost sessions); zero is unlimited
    pub max_attempts: u32,
    pub dispatch_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: super::DEFAULT_HOST.to_string(),
            port: super::DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(5),
            max_attempts: 0,
            dispatch_capacity: DEFAULT_DISPATCH_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// Observable connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub phase: LinkPhase,
    /// Consecutive retries since the last successful connect
    pub retry_count: u32,
    /// Attempts spent over the client's lifetime: failed connects plus lost
    /// sessions. Never reset; `max_attempts` caps it.
    pub spent_attempts: u32,
    /// When the last ping was received
    pub last_ping: Option<Instant>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            phase: LinkPhase::Disconnected,
            retry_count: 0,
            spent_attempts: 0,
            last_ping: None,
        }
    }
}

/// Why a connected session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the connection
    Closed,
    Io(String),
    /// No ping within the heartbeat timeout
    HeartbeatTimeout(Duration),
    /// Stopped through the stop handle
    Stopped,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "connection closed by server"),
            DisconnectReason::Io(e) => write!(f, "I/O error: {}", e),
            DisconnectReason::HeartbeatTimeout(idle) => {
                write!(f, "no heartbeat for {}ms", idle.as_millis())
            }
            DisconnectReason::Stopped => write!(f, "stopped"),
        }
    }
}

/// Stops a [`LogClient`] from any task
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Request a stop; cancels a pending retry wait and ends the current session
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct LogClient {
    config: ClientConfig,
    sinks: EventSinks,
    stream: Option<TcpStream>,
    state: Arc<watch::Sender<LinkState>>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    dispatcher: Option<EventDispatcher>,
}

impl fmt::Debug for LogClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogClient")
            .field("addr", &self.config.addr())
            .field("connected", &self.stream.is_some())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl LogClient {
    pub fn new(config: ClientConfig, sinks: EventSinks) -> Self {
        let (state, _) = watch::channel(LinkState::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            config,
            sinks,
            stream: None,
            state: Arc::new(state),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            dispatcher: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Subscribe to state changes
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn update_state(&self, modify: impl FnOnce(&mut LinkState)) {
        self.state.send_modify(modify);
    }

    fn set_phase(&self, phase: LinkPhase) {
        self.update_state(|state| state.phase = phase);
    }

    /// Sink dispatcher, started on first use so it lands on the caller's runtime
    fn dispatcher(&mut self) -> &EventDispatcher {
        let capacity = self.config.dispatch_capacity;
        let sinks = &self.sinks;
        self.dispatcher
            .get_or_insert_with(|| sinks.clone().spawn_dispatcher(capacity))
    }

    /// Make a single connection attempt
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.is_stopped() {
            return Err(ClientError::Stopped);
        }

        let addr = self.config.addr();
        let timeout = self.config.connect_timeout;
        self.set_phase(LinkPhase::Connecting);
        debug!("Connecting to {}", addr);

        let mut stop = self.stop_rx.clone();
        let attempt = tokio::select! {
            attempt = tokio::time::timeout(timeout, TcpStream::connect(&addr)) => attempt,
            _ = wait_stopped(&mut stop) => {
                self.set_phase(LinkPhase::Stopped);
                return Err(ClientError::Stopped);
            }
        };

        match attempt {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", e);
                }
                info!("Connected to log server at {}", addr);
                self.stream = Some(stream);
                self.set_phase(LinkPhase::Connected);
                Ok(())
            }
            Ok(Err(source)) => {
                self.set_phase(LinkPhase::Disconnected);
                Err(ClientError::Connect { addr, source })
            }
            Err(_) => {
                self.set_phase(LinkPhase::Disconnected);
                Err(ClientError::ConnectTimeout { addr, timeout })
            }
        }
    }

    /// Run the read loop on the established connection until it ends
    ///
    /// The disconnect sink is invoked for every reason except an explicit stop.
    pub async fn listen(&mut self) -> Result<DisconnectReason, ClientError> {
        let stream = self.stream.take().ok_or(ClientError::NotConnected)?;
        let config = self.config.clone();
        let stop = self.stop_rx.clone();
        let state = self.state.clone();

        let dispatcher = self.dispatcher();
        let reason = session(stream, &config, dispatcher, stop, &state).await;
        if reason != DisconnectReason::Stopped {
            dispatcher.submit(SinkEvent::Disconnected(reason.to_string()));
        }

        self.set_phase(match reason {
            DisconnectReason::Stopped => LinkPhase::Stopped,
            _ => LinkPhase::Disconnected,
        });
        Ok(reason)
    }

    /// Keep the link up until stopped or out of attempts
    ///
    /// Returns the final state. Events already queued for the sinks are
    /// delivered before this returns.
    pub async fn run(mut self) -> LinkState {
        let addr = self.config.addr();
        let mut first_attempt = true;

        while !self.is_stopped() {
            match self.connect().await {
                Ok(()) => {
                    self.update_state(|state| state.retry_count = 0);
                    if !first_attempt {
                        info!("Reconnected to {}", addr);
                        self.dispatcher().submit(SinkEvent::Reconnected);
                    }
                    first_attempt = false;

                    match self.listen().await {
                        Ok(DisconnectReason::Stopped) => break,
                        Ok(reason) => warn!("Lost connection to {}: {}", addr, reason),
                        Err(e) => warn!("Listen on {} failed: {}", addr, e),
                    }
                }
                Err(ClientError::Stopped) => break,
                Err(e) => {
                    first_attempt = false;
                    warn!("Connection attempt failed: {}", e);
                }
            }

            if self.spend_attempt() {
                break;
            }

            if self.config.retry_interval.is_zero() {
                info!("Reconnecting disabled, stopping");
                break;
            }
            self.update_state(|state| state.retry_count += 1);
            if !self.wait_retry().await {
                break;
            }
        }

        self.stream = None;
        self.set_phase(LinkPhase::Stopped);
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown().await;
        }
        info!("Log client for {} stopped", addr);
        let final_state = self.state.borrow().clone();
        final_state
    }

    /// Count one spent attempt; `true` once the budget is exhausted
    fn spend_attempt(&self) -> bool {
        self.update_state(|state| state.spent_attempts += 1);
        let spent = self.state.borrow().spent_attempts;
        let max = self.config.max_attempts;
        if max > 0 && spent >= max {
            warn!("Giving up after {} of {} attempts", spent, max);
            return true;
        }
        false
    }

    /// Sleep for the retry interval; `false` when stopped meanwhile
    async fn wait_retry(&self) -> bool {
        let interval = self.config.retry_interval;
        debug!("Retrying in {:?}", interval);
        let mut stop = self.stop_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(interval) => true,
            _ = wait_stopped(&mut stop) => false,
        }
    }
}

/// Resolve once the stop flag is set
async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            // Sender gone, the flag can no longer flip
            std::future::pending::<()>().await;
        }
    }
}

async fn session(
    stream: TcpStream,
    config: &ClientConfig,
    dispatcher: &EventDispatcher,
    mut stop: watch::Receiver<bool>,
    state: &watch::Sender<LinkState>,
) -> DisconnectReason {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = WireReader::new(read_half);
    let mut last_ping = Instant::now();

    let reason = loop {
        let read = tokio::select! {
            read = tokio::time::timeout(config.read_timeout, reader.next_frame()) => read,
            _ = wait_stopped(&mut stop) => break DisconnectReason::Stopped,
        };

        match read {
            // Nothing within the read timeout; fall through to the heartbeat check
            Err(_) => {}
            Ok(Ok(Some(Frame::Message(WireMessage::Ping { timestamp })))) => {
                last_ping = Instant::now();
                state.send_modify(|s| s.last_ping = Some(last_ping));
                debug!("Ping from server (sent at {})", timestamp);

                let pong = WireMessage::pong();
                match tokio::time::timeout(config.write_timeout, write_message(&mut write_half, &pong))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break DisconnectReason::Io(format!("{:#}", e)),
                    Err(_) => {
                        break DisconnectReason::Io(format!(
                            "pong write timed out after {:?}",
                            config.write_timeout
                        ))
                    }
                }
            }
            Ok(Ok(Some(Frame::Message(WireMessage::Log { content })))) => {
                if let Some(event) = classify(&content) {
                    debug!("{} event for {}: {}", event.as_str(), event.player(), event);
                    dispatcher.submit(SinkEvent::Log(event));
                }
            }
            Ok(Ok(Some(Frame::Message(WireMessage::Pong { .. })))) => {
                debug!("Ignoring pong from server");
            }
            Ok(Ok(Some(Frame::Malformed(reason)))) => {
                warn!("Skipping malformed record: {}", reason);
            }
            Ok(Ok(None)) => break DisconnectReason::Closed,
            Ok(Err(e)) => break DisconnectReason::Io(e.to_string()),
        }

        let idle = last_ping.elapsed();
        if idle > config.heartbeat_timeout {
            break DisconnectReason::HeartbeatTimeout(idle);
        }
    };

    let _ = write_half.shutdown().await;
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logwatch::LogEvent;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn test_config(port: u16) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_millis(20),
            max_attempts: 0,
            dispatch_capacity: 16,
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for sink")
            .expect("sink channel closed")
    }

    #[tokio::test]
    async fn test_listen_before_connect() {
        let mut client = LogClient::new(test_config(1), EventSinks::new());
        assert!(matches!(
            client.listen().await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_answers_ping_and_dispatches_chat() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        let sinks = EventSinks::new()
            .with_chat(move |p: &str, m: &str| -> anyhow::Result<()> {
                let _ = event_tx.send(LogEvent::Chat {
                    player: p.to_string(),
                    message: m.to_string(),
                });
                Ok(())
            })
            .with_disconnected(move |reason: &str| -> anyhow::Result<()> {
                let _ = lost_tx.send(reason.to_string());
                Ok(())
            });

        let mut client = LogClient::new(test_config(port), sinks);
        let client_task = tokio::spawn(async move {
            client.connect().await.unwrap();
            client.listen().await.unwrap()
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = WireReader::new(read_half);

        write_message(&mut write_half, &WireMessage::Ping { timestamp: 1 })
            .await
            .unwrap();
        match reader.next_frame().await.unwrap() {
            Some(Frame::Message(WireMessage::Pong { timestamp })) => assert!(timestamp > 1),
            other => panic!("expected pong, got {:?}", other),
        }

        write_message(
            &mut write_half,
            &WireMessage::log("[12:00:01] [Server thread/INFO]: <Alex> anyone got iron?"),
        )
        .await
        .unwrap();
        write_message(&mut write_half, &WireMessage::log("[Server thread/INFO]: Saving chunks"))
            .await
            .unwrap();
        assert_eq!(
            recv(&mut event_rx).await,
            LogEvent::Chat {
                player: "Alex".to_string(),
                message: "anyone got iron?".to_string()
            }
        );

        drop(write_half);
        drop(reader);
        assert_eq!(client_task.await.unwrap(), DisconnectReason::Closed);
        assert_eq!(recv(&mut lost_rx).await, "connection closed by server");
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = ClientConfig {
            heartbeat_timeout: Duration::from_millis(200),
            ..test_config(port)
        };
        let mut client = LogClient::new(config, EventSinks::new());
        let client_task = tokio::spawn(async move {
            client.connect().await.unwrap();
            client.listen().await.unwrap()
        });

        // Accept and stay silent
        let (_stream, _) = listener.accept().await.unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(3), client_task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, DisconnectReason::HeartbeatTimeout(_)));
    }

    #[tokio::test]
    async fn test_retry_budget_is_exhausted() {
        let port = closed_port().await;
        let config = ClientConfig {
            max_attempts: 3,
            ..test_config(port)
        };

        let retry_interval = config.retry_interval;

        let started = Instant::now();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            LogClient::new(config, EventSinks::new()).run(),
        )
        .await
        .unwrap();
        assert_eq!(state.phase, LinkPhase::Stopped);
        assert_eq!(state.spent_attempts, 3);
        // Three attempts are separated by two retry waits
        assert!(started.elapsed() >= retry_interval * 2);
    }

    #[tokio::test]
    async fn test_budget_counts_lost_sessions() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let acceptor = tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let config = ClientConfig {
            max_attempts: 2,
            ..test_config(port)
        };
        let state = tokio::time::timeout(
            Duration::from_secs(3),
            LogClient::new(config, EventSinks::new()).run(),
        )
        .await
        .expect("client kept reconnecting");
        acceptor.abort();

        assert_eq!(state.phase, LinkPhase::Stopped);
        assert_eq!(state.spent_attempts, 2);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_first_connect_is_not_a_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (back_tx, mut back_rx) = mpsc::unbounded_channel();
        let sinks = EventSinks::new().with_reconnected(move || -> anyhow::Result<()> {
            let _ = back_tx.send(());
            Ok(())
        });

        let client = LogClient::new(test_config(port), sinks);
        let stop = client.stop_handle();
        let mut state = client.state();
        let run = tokio::spawn(client.run());

        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(3),
            state.wait_for(|s| s.phase == LinkPhase::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        stop.stop();
        let final_state = tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_state.spent_attempts, 0);
        // Queued events are delivered before run returns
        assert!(back_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_streams_events_from_log_server() {
        use crate::logwatch::TailerConfig;
        use crate::stream::server::{LogServer, ServerConfig};
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("latest.log");
        std::fs::write(&log, "[Server thread/INFO]: Starting minecraft server\n").unwrap();

        let server_config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            log_path: log.clone(),
            heartbeat_interval: Duration::from_millis(50),
            client_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_secs(1),
            queue_capacity: 16,
            tailer: TailerConfig {
                poll_interval: Duration::from_millis(10),
                stat_every: 10,
                reopen_backoff: Duration::from_millis(10),
                ..TailerConfig::default()
            },
        };
        let server = LogServer::bind(server_config).await.unwrap();
        let port = server.local_addr().unwrap().port();
        let registry = server.registry();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_task = tokio::spawn(server.run(shutdown_rx));

        let (join_tx, mut join_rx) = mpsc::unbounded_channel();
        let sinks = EventSinks::new().with_join(move |player: &str| -> anyhow::Result<()> {
            let _ = join_tx.send(player.to_string());
            Ok(())
        });
        let client = LogClient::new(test_config(port), sinks);
        let stop = client.stop_handle();
        let state = client.state();
        let run = tokio::spawn(client.run());

        for _ in 0..300 {
            if registry.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.len(), 1);

        // Pongs keep the connection registered well past the client timeout
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(registry.len(), 1);
        assert!(state.borrow().last_ping.is_some());

        let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        file.write_all(b"[12:00:00] [Server thread/INFO]: Steve joined the game\n")
            .unwrap();
        assert_eq!(recv(&mut join_rx).await, "Steve");

        stop.stop();
        let final_state = tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_state.spent_attempts, 0);

        shutdown_tx.send(true).unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_zero_retry_interval_stops_after_first_failure() {
        let port = closed_port().await;
        let config = ClientConfig {
            retry_interval: Duration::ZERO,
            ..test_config(port)
        };

        let state = LogClient::new(config, EventSinks::new()).run().await;
        assert_eq!(state.phase, LinkPhase::Stopped);
        assert_eq!(state.spent_attempts, 1);
        assert_eq!(state.retry_count, 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_retry_wait() {
        let port = closed_port().await;
        let config = ClientConfig {
            retry_interval: Duration::from_secs(60),
            ..test_config(port)
        };

        let client = LogClient::new(config, EventSinks::new());
        let stop = client.stop_handle();
        let mut state = client.state();
        let run = tokio::spawn(client.run());

        tokio::time::timeout(
            Duration::from_secs(3),
            state.wait_for(|s| s.spent_attempts == 1),
        )
        .await
        .unwrap()
        .unwrap();
        stop.stop();

        let final_state = tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_state.phase, LinkPhase::Stopped);
        assert_eq!(final_state.spent_attempts, 1);
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn test_reconnect_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        let (back_tx, mut back_rx) = mpsc::unbounded_channel();
        let sinks = EventSinks::new()
            .with_disconnected(move |reason: &str| -> anyhow::Result<()> {
                let _ = lost_tx.send(reason.to_string());
                Ok(())
            })
            .with_reconnected(move || -> anyhow::Result<()> {
                let _ = back_tx.send(());
                Ok(())
            });

        let client = LogClient::new(test_config(port), sinks);
        let stop = client.stop_handle();
        let run = tokio::spawn(client.run());

        let (first, _) = listener.accept().await.unwrap();
        drop(first);
        assert_eq!(recv(&mut lost_rx).await, "connection closed by server");

        let (_second, _) = listener.accept().await.unwrap();
        recv(&mut back_rx).await;

        stop.stop();
        let final_state = tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(final_state.phase, LinkPhase::Stopped);
        // The lost first session spent one attempt, the stop spends none
        assert_eq!(final_state.spent_attempts, 1);
        // A stop is not reported as a lost connection
        assert!(lost_rx.try_recv().is_err());
    }
}
