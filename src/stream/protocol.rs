//! Wire protocol for the log stream
//!
//! Every record is a single JSON object followed by `\n`. JSON string escaping
//! keeps the separator out of any payload, so record boundaries are line
//! boundaries.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest record accepted from a peer
pub const MAX_RECORD_LEN: usize = 1024 * 1024;

/// Messages exchanged between the log server and its clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// One line read from the watched log file
    Log {
        /// Line content without its terminator
        content: String,
    },
    /// Liveness probe sent by the server
    Ping {
        /// Sender clock, Unix milliseconds
        timestamp: i64,
    },
    /// Reply to a ping, sent by the client
    Pong {
        /// Sender clock, Unix milliseconds
        timestamp: i64,
    },
}

impl WireMessage {
    pub fn log(content: impl Into<String>) -> Self {
        WireMessage::Log {
            content: content.into(),
        }
    }

    pub fn ping() -> Self {
        WireMessage::Ping {
            timestamp: now_millis(),
        }
    }

    pub fn pong() -> Self {
        WireMessage::Pong {
            timestamp: now_millis(),
        }
    }

    /// Name of the `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Log { .. } => "log",
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
        }
    }

    /// Encode as one newline-terminated record
    pub fn encode(&self) -> Result<String> {
        let mut record = serde_json::to_string(self).context("Failed to serialize message")?;
        record.push('\n');
        Ok(record)
    }

    /// Decode one record; surrounding whitespace and the terminator are ignored
    pub fn decode(record: &str) -> Result<Self> {
        serde_json::from_str(record.trim()).context("Failed to parse message")
    }
}

/// Current wall clock as Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Write a single record and flush it
pub async fn write_message<W>(writer: &mut W, message: &WireMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let record = message.encode()?;
    writer
        .write_all(record.as_bytes())
        .await
        .context("Failed to write message")?;
    writer.flush().await.context("Failed to flush stream")?;
    Ok(())
}

/// One record read off the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A well-formed message
    Message(WireMessage),
    /// A record that could not be decoded; the stream itself is still usable
    Malformed(String),
}

/// Record reader over any byte stream
///
/// Bytes of a partially received record are kept between calls, so
/// `next_frame` may be raced in `tokio::select!` or wrapped in
/// `tokio::time::timeout` without losing data.
pub struct WireReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            pending: Vec::new(),
        }
    }

    /// Read the next record
    ///
    /// Returns `Ok(None)` at end of stream. Blank lines are skipped. A record
    /// longer than [`MAX_RECORD_LEN`] is reported as an `InvalidData` error.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            let available = self.inner.fill_buf().await?;

            if available.is_empty() {
                // End of stream: a trailing unterminated record still counts
                if self.pending.iter().all(u8::is_ascii_whitespace) {
                    self.pending.clear();
                    return Ok(None);
                }
                return Ok(Some(self.take_frame()));
            }

            let (consumed, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.pending.extend_from_slice(&available[..pos]);
                    (pos + 1, true)
                }
                None => {
                    self.pending.extend_from_slice(available);
                    (available.len(), false)
                }
            };
            self.inner.consume(consumed);

            if self.pending.len() > MAX_RECORD_LEN {
                self.pending.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("record exceeds {} bytes", MAX_RECORD_LEN),
                ));
            }

            if complete {
                if self.pending.iter().all(u8::is_ascii_whitespace) {
                    self.pending.clear();
                    continue;
                }
                return Ok(Some(self.take_frame()));
            }
        }
    }

    fn take_frame(&mut self) -> Frame {
        let bytes = std::mem::take(&mut self.pending);
        match String::from_utf8(bytes) {
            Ok(text) => match WireMessage::decode(&text) {
                Ok(message) => Frame::Message(message),
                Err(e) => Frame::Malformed(format!("{:#}", e)),
            },
            Err(e) => Frame::Malformed(format!("invalid UTF-8: {}", e)),
        }
    }
}
