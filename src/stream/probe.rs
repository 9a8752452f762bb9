//! One-shot diagnostic connection to a log server

use std::fmt;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use super::error::ProbeError;
use super::protocol::{Frame, WireMessage, WireReader};

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub connect_timeout: Duration,
    /// How long to wait for the first record
    pub read_window: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_window: Duration::from_secs(10),
        }
    }
}

/// What the probe saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeReport {
    Record(WireMessage),
    Malformed(String),
    /// The server closed the connection without sending anything
    Closed,
    /// Nothing arrived within the read window
    Silent,
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeReport::Record(WireMessage::Log { content }) => write!(f, "log: {}", content),
            ProbeReport::Record(message) => write!(f, "{} record", message.kind()),
            ProbeReport::Malformed(reason) => write!(f, "malformed record: {}", reason),
            ProbeReport::Closed => write!(f, "connection closed by server"),
            ProbeReport::Silent => write!(f, "no data within the read window"),
        }
    }
}

/// Connect to `host:port`, read at most one record, disconnect
pub async fn probe(host: &str, port: u16, config: &ProbeConfig) -> Result<ProbeReport, ProbeError> {
    let addr = format!("{}:{}", host, port);
    let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            return Err(ProbeError::Refused { addr })
        }
        Ok(Err(e)) => return Err(ProbeError::Io(e)),
        Err(_) => {
            return Err(ProbeError::ConnectTimeout {
                addr,
                timeout: config.connect_timeout,
            })
        }
    };
    debug!("Probe connected to {}", addr);

    let mut reader = WireReader::new(stream);
    let report = match tokio::time::timeout(config.read_window, reader.next_frame()).await {
        Ok(Ok(Some(Frame::Message(message)))) => ProbeReport::Record(message),
        Ok(Ok(Some(Frame::Malformed(reason)))) => ProbeReport::Malformed(reason),
        Ok(Ok(None)) => ProbeReport::Closed,
        Ok(Err(e)) => return Err(ProbeError::Io(e)),
        Err(_) => ProbeReport::Silent,
    };
    debug!("Probe of {} finished: {}", addr, report);
    Ok(report)
}
