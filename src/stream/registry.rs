//! Registry of live client connections
//!
//! The registry is the only state shared between the accept loop, the
//! broadcast path, the heartbeat supervisor and the per-connection tasks.
//! Each entry owns the sending half of its connection's outbound queue;
//! dropping the entry ends the connection task, which closes the socket.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};
use uuid::Uuid;

use super::protocol::WireMessage;

/// Default depth of each connection's outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// One registered client connection
#[derive(Debug)]
pub struct ConnectionEntry {
    /// Peer address
    pub peer: SocketAddr,
    /// Outbound queue drained by the connection task
    sender: mpsc::Sender<WireMessage>,
    /// Last inbound message, milliseconds since the registry epoch
    last_active_ms: AtomicU64,
}

/// Outcome of one heartbeat sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections that were sent a ping
    pub pinged: usize,
    /// Connections removed for exceeding the client timeout
    pub expired: usize,
    /// Connections removed because the ping could not be queued
    pub failed: usize,
}

/// Concurrent set of connections, owned by one server instance
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, ConnectionEntry>,
    epoch: Instant,
    queue_capacity: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            epoch: Instant::now(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a new connection as active now
    ///
    /// Returns the connection id and the receiving half of its outbound queue.
    pub fn register(&self, peer: SocketAddr) -> (Uuid, mpsc::Receiver<WireMessage>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            ConnectionEntry {
                peer,
                sender,
                last_active_ms: AtomicU64::new(self.now_ms()),
            },
        );
        (id, receiver)
    }

    /// Mark a connection as active now
    pub fn touch(&self, id: &Uuid) {
        if let Some(entry) = self.connections.get(id) {
            entry.last_active_ms.store(self.now_ms(), Ordering::Relaxed);
        }
    }

    /// Time since the connection last sent anything
    pub fn idle_for(&self, id: &Uuid) -> Option<Duration> {
        self.connections.get(id).map(|entry| {
            let last = entry.last_active_ms.load(Ordering::Relaxed);
            Duration::from_millis(self.now_ms().saturating_sub(last))
        })
    }

    /// Deregister a connection
    ///
    /// Returns `true` only for the call that actually removed it.
    pub fn remove(&self, id: &Uuid, reason: &str) -> bool {
        match self.connections.remove(id) {
            Some((_, entry)) => {
                info!(
                    "Client {} ({}) removed: {} ({} remaining)",
                    entry.peer,
                    id,
                    reason,
                    self.connections.len()
                );
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Queue a message on every connection
    ///
    /// A connection whose queue is closed or full is removed; the others are
    /// unaffected. Returns the number of connections the message was queued for.
    pub fn broadcast(&self, message: &WireMessage) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for entry in self.connections.iter() {
            match entry.sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => failed.push((*entry.key(), "outbound queue full")),
                Err(TrySendError::Closed(_)) => failed.push((*entry.key(), "connection closed")),
            }
        }

        // Iteration guards are released before removing
        for (id, reason) in failed {
            self.remove(&id, reason);
        }

        delivered
    }

    /// Expire idle connections and ping the rest
    pub fn sweep(&self, client_timeout: Duration) -> SweepReport {
        let now = self.now_ms();
        let timeout_ms = client_timeout.as_millis() as u64;
        let ping = WireMessage::ping();

        let mut report = SweepReport::default();
        let mut expired = Vec::new();
        let mut failed = Vec::new();

        for entry in self.connections.iter() {
            let idle = now.saturating_sub(entry.last_active_ms.load(Ordering::Relaxed));
            if idle > timeout_ms {
                expired.push((*entry.key(), idle));
                continue;
            }
            match entry.sender.try_send(ping.clone()) {
                Ok(()) => report.pinged += 1,
                Err(_) => failed.push(*entry.key()),
            }
        }

        for (id, idle) in expired {
            if self.remove(&id, &format!("heartbeat timeout after {}ms", idle)) {
                report.expired += 1;
            }
        }
        for id in failed {
            if self.remove(&id, "ping could not be queued") {
                report.failed += 1;
            }
        }

        if report.expired > 0 || report.failed > 0 {
            debug!("Heartbeat sweep: {:?}", report);
        }
        report
    }

    /// Remove every connection, closing their transports
    pub fn clear(&self) -> usize {
        let ids: Vec<Uuid> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.iter()
            .filter(|id| self.remove(id, "server shutting down"))
            .count()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
