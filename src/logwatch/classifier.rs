//! Classification of raw server log lines into [`LogEvent`]s
//!
//! Checks run in a fixed order and the first match wins: join, leave,
//! advancement, death, chat. The anchored system-message patterns go first so
//! the substring-based death heuristic and the unanchored chat pattern only
//! see lines that are not a recognised system event. Server messages that
//! carry a `<name>` chat marker anywhere (including `[Not Secure] <name>`)
//! skip the system checks and are classified as chat.

use once_cell::sync::Lazy;
use regex::Regex;

use super::schema::LogEvent;

/// `[Server thread/INFO]`, optionally followed by a logger tag as printed by
/// modded servers, then `: <text>`
static SERVER_INFO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[Server thread/INFO\](?:\s*\[[^\]]*\])*:\s?(?P<text>.*)$")
        .expect("server info pattern")
});

/// The player is the first token; anything between it and the suffix, such
/// as `(formerly known as Alex)`, is ignored
static JOIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<player>[\w.]+)(?:\s.*)? joined the game$").expect("join pattern")
});

static LEAVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<player>[\w.]+)(?:\s.*)? left the game$").expect("leave pattern")
});

static ADVANCEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<player>\S+) has (?:made the advancement|completed the challenge|reached the goal) \[(?P<advancement>.+)\]$",
    )
    .expect("advancement pattern")
});

static CHAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(?P<player>[^>]+)>\s+(?P<message>.*)").expect("chat pattern"));

/// System messages that share vocabulary with death messages
const EXCLUDED_PHRASES: &[&str] = &[
    "logged in",
    "lost connection",
    "disconnected",
    "joined the game",
    "left the game",
];

/// Substrings found in vanilla death messages
const DEATH_PHRASES: &[&str] = &[
    "was slain by",
    "was shot by",
    "was killed",
    "was fireballed by",
    "was pummeled by",
    "was blown up by",
    "was squashed by",
    "was skewered by",
    "was impaled",
    "was stung to death",
    "was poked to death",
    "was pricked to death",
    "was struck by lightning",
    "was frozen to death",
    "was obliterated by",
    "drowned",
    "hit the ground",
    "fell from",
    "fell off",
    "fell out of the world",
    "fell into",
    "blew up",
    "burned to death",
    "went up in flames",
    "walked into fire",
    "walked into the danger zone",
    "tried to swim in lava",
    "suffocated",
    "starved to death",
    "froze to death",
    "withered away",
    "experienced kinetic energy",
    "didn't want to live",
    "died",
];

/// Classify one raw log line
///
/// Returns `None` for lines that carry no player event.
pub fn classify(line: &str) -> Option<LogEvent> {
    let line = line.trim_end();
    let system = server_message(line).filter(|text| !CHAT.is_match(text));

    if let Some(text) = system {
        if let Some(caps) = JOIN.captures(text) {
            return Some(LogEvent::Join {
                player: caps["player"].to_string(),
            });
        }
        if let Some(caps) = LEAVE.captures(text) {
            return Some(LogEvent::Leave {
                player: caps["player"].to_string(),
            });
        }
        if let Some(caps) = ADVANCEMENT.captures(text) {
            return Some(LogEvent::Advancement {
                player: caps["player"].to_string(),
                advancement: caps["advancement"].to_string(),
            });
        }
        if let Some(event) = death_event(text) {
            return Some(event);
        }
    }

    CHAT.captures(line).map(|caps| LogEvent::Chat {
        player: caps["player"].to_string(),
        message: caps["message"].trim_end().to_string(),
    })
}

/// Message text of a `[Server thread/INFO]` line
pub fn server_message(line: &str) -> Option<&str> {
    SERVER_INFO
        .captures(line)
        .and_then(|caps| caps.name("text"))
        .map(|m| m.as_str().trim())
}

fn death_event(text: &str) -> Option<LogEvent> {
    if EXCLUDED_PHRASES.iter().any(|phrase| text.contains(phrase)) {
        return None;
    }
    if !DEATH_PHRASES.iter().any(|phrase| text.contains(phrase)) {
        return None;
    }

    // `[Server] ...` from /say and similar prefixes are not player names
    let player = text.split_whitespace().next()?;
    if !is_player_name(player) {
        return None;
    }
    Some(LogEvent::Death {
        player: player.to_string(),
        reason: text.to_string(),
    })
}

fn is_player_name(token: &str) -> bool {
    token
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}
