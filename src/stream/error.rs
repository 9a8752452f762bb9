//! Error types for callers that branch on the failure kind

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`LogClient`](super::client::LogClient) operations
#[derive(Debug, Error)]
pub enum ClientError {
    /// `listen` was called without an established connection
    #[error("not connected to a log server")]
    NotConnected,

    /// The client was stopped through its stop handle
    #[error("client stopped")]
    Stopped,

    #[error("connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Errors returned by [`probe`](super::probe::probe)
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("connection to {addr} refused")]
    Refused { addr: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
