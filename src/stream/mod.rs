//! Log streaming over TCP
//!
//! A [`LogServer`] runs next to the game server, tails its log and pushes
//! every new line to all connected clients as newline-delimited JSON. A
//! [`LogClient`] consumes that stream, keeps the link alive through
//! heartbeats and reconnects, and feeds classified events to its sinks.

pub mod client;
pub mod error;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::{ClientConfig, DisconnectReason, LinkPhase, LinkState, LogClient, StopHandle};
pub use error::{ClientError, ProbeError};
pub use probe::{probe, ProbeConfig, ProbeReport};
pub use protocol::{Frame, WireMessage, WireReader};
pub use registry::ConnectionRegistry;
pub use server::{LogServer, ServerConfig};

/// Default listen / connect host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default TCP port of the log stream
pub const DEFAULT_PORT: u16 = 25576;
