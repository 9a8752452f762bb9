//! Events recognised in server log lines

use std::fmt;

/// A player action extracted from one log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A chat message
    Chat { player: String, message: String },
    /// A player joined the server
    Join { player: String },
    /// A player left the server
    Leave { player: String },
    /// A player earned an advancement, challenge or goal
    Advancement { player: String, advancement: String },
    /// A player died; `reason` is the full death message
    Death { player: String, reason: String },
}

impl LogEvent {
    /// The player the event is about
    pub fn player(&self) -> &str {
        match self {
            LogEvent::Chat { player, .. } => player,
            LogEvent::Join { player } => player,
            LogEvent::Leave { player } => player,
            LogEvent::Advancement { player, .. } => player,
            LogEvent::Death { player, .. } => player,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogEvent::Chat { .. } => "chat",
            LogEvent::Join { .. } => "join",
            LogEvent::Leave { .. } => "leave",
            LogEvent::Advancement { .. } => "advancement",
            LogEvent::Death { .. } => "death",
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::Chat { player, message } => write!(f, "<{}> {}", player, message),
            LogEvent::Join { player } => write!(f, "{} joined", player),
            LogEvent::Leave { player } => write!(f, "{} left", player),
            LogEvent::Advancement {
                player,
                advancement,
            } => write!(f, "{} earned [{}]", player, advancement),
            LogEvent::Death { reason, .. } => write!(f, "{}", reason),
        }
    }
}
