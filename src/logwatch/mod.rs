//! Minecraft server log tailing and classification
//!
//! The [`Tailer`] follows `latest.log` across rotations and [`classify`] turns
//! each line into a [`LogEvent`] when it describes a player action.

pub mod classifier;
pub mod schema;
pub mod tailer;

pub use classifier::classify;
pub use schema::LogEvent;
pub use tailer::{TailPoll, Tailer, TailerConfig, DEFAULT_MAX_LINE_LEN};
