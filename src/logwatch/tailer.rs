//! Log file tailing
//!
//! Follows a single growing log file and emits every complete line appended
//! after activation. Rotation (the file moved aside and recreated, or
//! truncated) is detected by periodically re-checking the file's identity and
//! size.

use std::fs::{File, Metadata};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Longest line the tailer forwards; half a wire record leaves room for framing
pub const DEFAULT_MAX_LINE_LEN: usize = crate::stream::protocol::MAX_RECORD_LEN / 2;

/// Configuration for the tailer
#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// Pause between polls when no complete line is available
    pub poll_interval: Duration,
    /// Re-check the file's identity every this many poll cycles
    pub stat_every: u32,
    /// Pause before reopening after the file went missing or an I/O error
    pub reopen_backoff: Duration,
    /// Lines longer than this many bytes are dropped
    pub max_line_len: usize,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            stat_every: 100,
            reopen_backoff: Duration::from_secs(1),
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// Identity of the file behind a path (device + inode)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(metadata: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    /// Identity is unavailable here; rotation falls back to size checks
    #[cfg(not(unix))]
    pub fn of(_metadata: &Metadata) -> Option<Self> {
        None
    }
}

/// The tailer's view of the currently open file
#[derive(Debug)]
struct TailCursor {
    identity: Option<FileIdentity>,
    /// Size seen at the last status check
    size: u64,
    reader: BufReader<File>,
    /// Bytes consumed so far, including a held-back partial line
    offset: u64,
    /// Start of a line whose terminator has not been written yet
    partial: Vec<u8>,
    /// Skipping the rest of an overlong line
    discarding: bool,
}

impl TailCursor {
    fn open_at_end(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let metadata = file.metadata()?;
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            identity: FileIdentity::of(&metadata),
            size,
            reader: BufReader::new(file),
            offset: size,
            partial: Vec::new(),
            discarding: false,
        })
    }

    /// Read the next complete line of at most `max_len` bytes
    ///
    /// `partial` never grows past `max_len + 1` bytes. An overlong line is
    /// logged and skipped up to its terminator.
    fn read_line(&mut self, max_len: usize) -> io::Result<Option<String>> {
        loop {
            let budget = (max_len + 1).saturating_sub(self.partial.len()) as u64;
            let read = (&mut self.reader)
                .take(budget)
                .read_until(b'\n', &mut self.partial)?;
            self.offset += read as u64;
            self.size = self.size.max(self.offset);

            let complete = self.partial.ends_with(b"\n");
            let content_len = self.partial.len() - usize::from(complete);

            if content_len > max_len {
                if !self.discarding {
                    warn!("Dropping log line longer than {} bytes", max_len);
                }
                self.partial.clear();
                self.discarding = !complete;
                continue;
            }
            if !complete {
                return Ok(None);
            }

            let bytes = std::mem::take(&mut self.partial);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            let line = String::from_utf8_lossy(&bytes);
            return Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()));
        }
    }
}

/// Result of one poll cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailPoll {
    /// A complete line was read
    Line(String),
    /// The file is open but has no complete line yet
    Idle,
    /// No usable file handle; retry after the reopen backoff
    Waiting,
}

/// Follows one log file
#[derive(Debug)]
pub struct Tailer {
    path: PathBuf,
    config: TailerConfig,
    cursor: Option<TailCursor>,
    cycles: u32,
    /// Set while the file is unavailable so the condition is logged once
    unavailable: bool,
}

impl Tailer {
    /// Activate the tailer, positioned at the current end of the file
    ///
    /// A missing file is not an error: the tailer waits for it to appear.
    pub fn new(path: impl Into<PathBuf>, config: TailerConfig) -> Self {
        let mut tailer = Self {
            path: path.into(),
            config,
            cursor: None,
            cycles: 0,
            unavailable: false,
        };
        tailer.reopen();
        tailer
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a file handle is currently open
    pub fn is_open(&self) -> bool {
        self.cursor.is_some()
    }

    /// Current read offset in the open file
    pub fn offset(&self) -> Option<u64> {
        self.cursor.as_ref().map(|c| c.offset)
    }

    /// Run one poll cycle
    pub fn poll(&mut self) -> TailPoll {
        self.cycles = self.cycles.wrapping_add(1);

        if self.cursor.is_none() && !self.reopen() {
            return TailPoll::Waiting;
        }

        if self.cycles % self.config.stat_every.max(1) == 0 {
            self.check_status();
            if self.cursor.is_none() {
                return TailPoll::Waiting;
            }
        }

        let Some(cursor) = self.cursor.as_mut() else {
            return TailPoll::Waiting;
        };
        match cursor.read_line(self.config.max_line_len) {
            Ok(Some(line)) => TailPoll::Line(line),
            Ok(None) => TailPoll::Idle,
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                self.cursor = None;
                TailPoll::Waiting
            }
        }
    }

    /// Open the file at its end; returns whether a handle is now open
    fn reopen(&mut self) -> bool {
        match TailCursor::open_at_end(&self.path) {
            Ok(cursor) => {
                if self.unavailable {
                    info!(
                        "Log file {} available again, resuming at offset {}",
                        self.path.display(),
                        cursor.offset
                    );
                }
                debug!("Opened {} at offset {}", self.path.display(), cursor.offset);
                self.cursor = Some(cursor);
                self.unavailable = false;
                true
            }
            Err(e) => {
                if !self.unavailable {
                    warn!("Cannot open {}: {}, waiting", self.path.display(), e);
                    self.unavailable = true;
                }
                false
            }
        }
    }

    /// Re-stat the path and reset the cursor on rotation
    fn check_status(&mut self) {
        let Some(cursor) = self.cursor.as_mut() else {
            return;
        };

        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(
                    "Log file {} disappeared, waiting for it to reappear",
                    self.path.display()
                );
                self.cursor = None;
                self.unavailable = true;
                return;
            }
            Err(e) => {
                warn!("Failed to stat {}: {}", self.path.display(), e);
                self.cursor = None;
                return;
            }
        };

        let identity = FileIdentity::of(&metadata);
        let size = metadata.len();

        if identity != cursor.identity || size < cursor.offset {
            info!(
                "Log file {} rotated (size {}, offset {}), reopening at end",
                self.path.display(),
                size,
                cursor.offset
            );
            self.cursor = None;
            self.reopen();
        } else {
            cursor.size = size;
        }
    }

    /// Run the tailer as a background task
    ///
    /// Lines are sent on `tx`. The task ends when `shutdown` flips or the
    /// receiver is dropped.
    pub fn spawn(
        mut self,
        tx: mpsc::Sender<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Tailing {}", self.path.display());

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let pause = match self.poll() {
                    TailPoll::Line(line) => {
                        if tx.send(line).await.is_err() {
                            warn!("Line receiver dropped, stopping tailer");
                            return;
                        }
                        continue;
                    }
                    TailPoll::Idle => self.config.poll_interval,
                    TailPoll::Waiting => self.config.reopen_backoff,
                };

                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.changed() => break,
                }
            }

            info!("Stopped tailing {}", self.path.display());
        })
    }
}
