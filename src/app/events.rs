//! Event sinks: the hooks consumers register to receive classified events
//!
//! Each hook is a single-method trait. Closures with the matching signature
//! implement the traits directly, e.g.
//!
//! ```
//! use mc_logstream::app::EventSinks;
//!
//! let sinks = EventSinks::new().with_join(|player: &str| -> anyhow::Result<()> {
//!     println!("{player} joined");
//!     Ok(())
//! });
//! ```

use anyhow::Result;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

use crate::logwatch::LogEvent;

/// Default depth of the dispatch queue
pub const DEFAULT_DISPATCH_CAPACITY: usize = 256;

/// Receives every chat message
pub trait ChatSink: Send + Sync {
    fn on_chat(&self, player: &str, message: &str) -> Result<()>;
}

/// Forwards chat messages upstream (e.g. into a chat bridge)
pub trait ForwardSink: Send + Sync {
    fn forward(&self, player: &str, message: &str) -> Result<()>;
}

pub trait JoinSink: Send + Sync {
    fn on_join(&self, player: &str) -> Result<()>;
}

pub trait LeaveSink: Send + Sync {
    fn on_leave(&self, player: &str) -> Result<()>;
}

pub trait AdvancementSink: Send + Sync {
    fn on_advancement(&self, player: &str, advancement: &str) -> Result<()>;
}

pub trait DeathSink: Send + Sync {
    fn on_death(&self, player: &str, reason: &str) -> Result<()>;
}

/// Called when an established connection to the log server is lost
pub trait DisconnectSink: Send + Sync {
    fn on_disconnected(&self, reason: &str) -> Result<()>;
}

/// Called when a connection succeeds after an earlier attempt
pub trait ReconnectSink: Send + Sync {
    fn on_reconnected(&self) -> Result<()>;
}

impl<F> ChatSink for F
where
    F: Fn(&str, &str) -> Result<()> + Send + Sync,
{
    fn on_chat(&self, player: &str, message: &str) -> Result<()> {
        self(player, message)
    }
}

impl<F> ForwardSink for F
where
    F: Fn(&str, &str) -> Result<()> + Send + Sync,
{
    fn forward(&self, player: &str, message: &str) -> Result<()> {
        self(player, message)
    }
}

impl<F> JoinSink for F
where
    F: Fn(&str) -> Result<()> + Send + Sync,
{
    fn on_join(&self, player: &str) -> Result<()> {
        self(player)
    }
}

impl<F> LeaveSink for F
where
    F: Fn(&str) -> Result<()> + Send + Sync,
{
    fn on_leave(&self, player: &str) -> Result<()> {
        self(player)
    }
}

impl<F> AdvancementSink for F
where
    F: Fn(&str, &str) -> Result<()> + Send + Sync,
{
    fn on_advancement(&self, player: &str, advancement: &str) -> Result<()> {
        self(player, advancement)
    }
}

impl<F> DeathSink for F
where
    F: Fn(&str, &str) -> Result<()> + Send + Sync,
{
    fn on_death(&self, player: &str, reason: &str) -> Result<()> {
        self(player, reason)
    }
}

impl<F> DisconnectSink for F
where
    F: Fn(&str) -> Result<()> + Send + Sync,
{
    fn on_disconnected(&self, reason: &str) -> Result<()> {
        self(reason)
    }
}

impl<F> ReconnectSink for F
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn on_reconnected(&self) -> Result<()> {
        self()
    }
}

/// Something the client hands to the sinks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// A classified log line
    Log(LogEvent),
    /// The connection was lost
    Disconnected(String),
    /// The connection was re-established
    Reconnected,
}

/// The registered sinks; unregistered hooks are no-ops
#[derive(Clone, Default)]
pub struct EventSinks {
    chat: Option<Arc<dyn ChatSink>>,
    forward: Option<Arc<dyn ForwardSink>>,
    join: Option<Arc<dyn JoinSink>>,
    leave: Option<Arc<dyn LeaveSink>>,
    advancement: Option<Arc<dyn AdvancementSink>>,
    death: Option<Arc<dyn DeathSink>>,
    disconnected: Option<Arc<dyn DisconnectSink>>,
    reconnected: Option<Arc<dyn ReconnectSink>>,
}

impl fmt::Debug for EventSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSinks")
            .field("chat", &self.chat.is_some())
            .field("forward", &self.forward.is_some())
            .field("join", &self.join.is_some())
            .field("leave", &self.leave.is_some())
            .field("advancement", &self.advancement.is_some())
            .field("death", &self.death.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .field("reconnected", &self.reconnected.is_some())
            .finish()
    }
}

impl EventSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chat(mut self, sink: impl ChatSink + 'static) -> Self {
        self.chat = Some(Arc::new(sink));
        self
    }

    pub fn with_forward(mut self, sink: impl ForwardSink + 'static) -> Self {
        self.forward = Some(Arc::new(sink));
        self
    }

    pub fn with_join(mut self, sink: impl JoinSink + 'static) -> Self {
        self.join = Some(Arc::new(sink));
        self
    }

    pub fn with_leave(mut self, sink: impl LeaveSink + 'static) -> Self {
        self.leave = Some(Arc::new(sink));
        self
    }

    pub fn with_advancement(mut self, sink: impl AdvancementSink + 'static) -> Self {
        self.advancement = Some(Arc::new(sink));
        self
    }

    pub fn with_death(mut self, sink: impl DeathSink + 'static) -> Self {
        self.death = Some(Arc::new(sink));
        self
    }

    pub fn with_disconnected(mut self, sink: impl DisconnectSink + 'static) -> Self {
        self.disconnected = Some(Arc::new(sink));
        self
    }

    pub fn with_reconnected(mut self, sink: impl ReconnectSink + 'static) -> Self {
        self.reconnected = Some(Arc::new(sink));
        self
    }

    /// Invoke the sinks interested in `event`
    ///
    /// Every invocation is isolated: an error or a panic in one sink is logged
    /// and does not prevent the others from running.
    pub fn deliver(&self, event: &SinkEvent) {
        match event {
            SinkEvent::Log(LogEvent::Chat { player, message }) => {
                if let Some(sink) = &self.chat {
                    guarded("chat", || sink.on_chat(player, message));
                }
                if let Some(sink) = &self.forward {
                    guarded("forward", || sink.forward(player, message));
                }
            }
            SinkEvent::Log(LogEvent::Join { player }) => {
                if let Some(sink) = &self.join {
                    guarded("join", || sink.on_join(player));
                }
            }
            SinkEvent::Log(LogEvent::Leave { player }) => {
                if let Some(sink) = &self.leave {
                    guarded("leave", || sink.on_leave(player));
                }
            }
            SinkEvent::Log(LogEvent::Advancement {
                player,
                advancement,
            }) => {
                if let Some(sink) = &self.advancement {
                    guarded("advancement", || sink.on_advancement(player, advancement));
                }
            }
            SinkEvent::Log(LogEvent::Death { player, reason }) => {
                if let Some(sink) = &self.death {
                    guarded("death", || sink.on_death(player, reason));
                }
            }
            SinkEvent::Disconnected(reason) => {
                if let Some(sink) = &self.disconnected {
                    guarded("disconnected", || sink.on_disconnected(reason));
                }
            }
            SinkEvent::Reconnected => {
                if let Some(sink) = &self.reconnected {
                    guarded("reconnected", || sink.on_reconnected());
                }
            }
        }
    }

    /// Start a task that delivers events from a bounded queue
    pub fn spawn_dispatcher(self, capacity: usize) -> EventDispatcher {
        let (tx, mut rx) = mpsc::channel::<SinkEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.deliver(&event);
            }
            debug!("Event dispatcher stopped");
        });
        EventDispatcher { tx, handle }
    }
}

fn guarded(hook: &str, call: impl FnOnce() -> Result<()>) {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{} sink failed: {:#}", hook, e),
        Err(_) => error!("{} sink panicked", hook),
    }
}

/// Handle to the running dispatcher task
#[derive(Debug)]
pub struct EventDispatcher {
    tx: mpsc::Sender<SinkEvent>,
    handle: tokio::task::JoinHandle<()>,
}

impl EventDispatcher {
    /// Queue an event without waiting
    ///
    /// When the queue is full the event is dropped and `false` is returned,
    /// so a slow sink never stalls the connection's read loop.
    pub fn submit(&self, event: SinkEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {:?}", event);
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!("Event dispatcher gone, dropping {:?}", event);
                false
            }
        }
    }

    /// Deliver what is already queued, then stop
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            error!("Event dispatcher task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn chat_event(player: &str, message: &str) -> SinkEvent {
        SinkEvent::Log(LogEvent::Chat {
            player: player.to_string(),
            message: message.to_string(),
        })
    }

    #[test]
    fn test_chat_reaches_chat_and_forward_hooks() {
        let log = recorder();
        let (a, b) = (log.clone(), log.clone());
        let sinks = EventSinks::new()
            .with_chat(move |p: &str, m: &str| -> Result<()> {
                a.lock().unwrap().push(format!("chat {} {}", p, m));
                Ok(())
            })
            .with_forward(move |p: &str, m: &str| -> Result<()> {
                b.lock().unwrap().push(format!("forward {} {}", p, m));
                Ok(())
            });

        sinks.deliver(&chat_event("Steve", "hi"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["chat Steve hi".to_string(), "forward Steve hi".to_string()]
        );
    }

    #[test]
    fn test_player_actions_use_dedicated_hooks_only() {
        let log = recorder();
        let (a, b) = (log.clone(), log.clone());
        let sinks = EventSinks::new()
            .with_chat(move |p: &str, _m: &str| -> Result<()> {
                a.lock().unwrap().push(format!("chat {}", p));
                Ok(())
            })
            .with_join(move |p: &str| -> Result<()> {
                b.lock().unwrap().push(format!("join {}", p));
                Ok(())
            });

        sinks.deliver(&SinkEvent::Log(LogEvent::Join {
            player: "Alex".to_string(),
        }));
        sinks.deliver(&SinkEvent::Log(LogEvent::Leave {
            player: "Alex".to_string(),
        }));
        assert_eq!(*log.lock().unwrap(), vec!["join Alex".to_string()]);
    }

    #[test]
    fn test_failing_sink_does_not_block_others() {
        let log = recorder();
        let a = log.clone();
        let sinks = EventSinks::new()
            .with_chat(|_p: &str, _m: &str| -> Result<()> { anyhow::bail!("bridge offline") })
            .with_forward(move |p: &str, _m: &str| -> Result<()> {
                a.lock().unwrap().push(p.to_string());
                Ok(())
            });

        sinks.deliver(&chat_event("Steve", "hi"));
        assert_eq!(*log.lock().unwrap(), vec!["Steve".to_string()]);
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let log = recorder();
        let a = log.clone();
        let sinks = EventSinks::new()
            .with_death(|_p: &str, _r: &str| -> Result<()> { panic!("sink bug") })
            .with_disconnected(move |reason: &str| -> Result<()> {
                a.lock().unwrap().push(reason.to_string());
                Ok(())
            });

        sinks.deliver(&SinkEvent::Log(LogEvent::Death {
            player: "Steve".to_string(),
            reason: "Steve drowned".to_string(),
        }));
        sinks.deliver(&SinkEvent::Disconnected("closed".to_string()));
        assert_eq!(*log.lock().unwrap(), vec!["closed".to_string()]);
    }

    #[test]
    fn test_unregistered_hooks_are_noops() {
        let sinks = EventSinks::new();
        sinks.deliver(&chat_event("Steve", "hi"));
        sinks.deliver(&SinkEvent::Reconnected);
        assert_eq!(
            format!("{:?}", sinks),
            "EventSinks { chat: false, forward: false, join: false, leave: false, \
             advancement: false, death: false, disconnected: false, reconnected: false }"
        );
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_order() {
        let log = recorder();
        let a = log.clone();
        let dispatcher = EventSinks::new()
            .with_chat(move |_p: &str, m: &str| -> Result<()> {
                a.lock().unwrap().push(m.to_string());
                Ok(())
            })
            .spawn_dispatcher(16);

        assert!(dispatcher.submit(chat_event("Steve", "one")));
        assert!(dispatcher.submit(chat_event("Steve", "two")));
        dispatcher.shutdown().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["one".to_string(), "two".to_string()]
        );
    }
}
