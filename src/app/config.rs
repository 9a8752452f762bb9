use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logwatch::{TailerConfig, DEFAULT_MAX_LINE_LEN};
use crate::stream::registry::DEFAULT_QUEUE_CAPACITY;
use crate::stream::{ClientConfig, ProbeConfig, ServerConfig, DEFAULT_HOST, DEFAULT_PORT};

/// Application configuration, stored as TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default log filter; `RUST_LOG` and `--log-level` take precedence
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub client: ClientSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerSettings::default(),
            client: ClientSettings::default(),
        }
    }
}

/// Settings for `serve`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// The game server's current log file
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Poll cycles between rotation checks
    #[serde(default = "default_stat_every")]
    pub stat_every: u32,
    /// Pause before reopening a missing or unreadable log file
    #[serde(default = "default_reopen_backoff")]
    pub reopen_backoff_ms: u64,
    /// Longer lines are dropped by the tailer
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_path: default_log_path(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            client_timeout_secs: default_client_timeout(),
            write_timeout_secs: default_write_timeout(),
            poll_interval_ms: default_poll_interval(),
            stat_every: default_stat_every(),
            reopen_backoff_ms: default_reopen_backoff(),
            max_line_len: default_max_line_len(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Settings for `listen` and `probe`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// 0 disables reconnecting
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    /// 0 means unlimited
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_dispatch_capacity")]
    pub dispatch_capacity: usize,
    #[serde(default = "default_probe_connect_timeout")]
    pub probe_connect_timeout_secs: u64,
    #[serde(default = "default_probe_read_window")]
    pub probe_read_window_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            write_timeout_secs: default_write_timeout(),
            retry_interval_secs: default_retry_interval(),
            max_attempts: 0,
            dispatch_capacity: default_dispatch_capacity(),
            probe_connect_timeout_secs: default_probe_connect_timeout(),
            probe_read_window_secs: default_probe_read_window(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_path() -> PathBuf {
    PathBuf::from("logs/latest.log")
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_client_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    100
}

fn default_stat_every() -> u32 {
    100
}

fn default_reopen_backoff() -> u64 {
    1000
}

fn default_max_line_len() -> usize {
    DEFAULT_MAX_LINE_LEN
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_retry_interval() -> u64 {
    5
}

fn default_dispatch_capacity() -> usize {
    crate::app::events::DEFAULT_DISPATCH_CAPACITY
}

fn default_probe_connect_timeout() -> u64 {
    5
}

fn default_probe_read_window() -> u64 {
    10
}

impl Config {
    /// Load from the default location, writing the defaults there on first run
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))
        } else {
            let config = Self::default();
            if let Err(e) = config.save_to(path) {
                tracing::warn!("Failed to save default config: {}", e);
            }
            Ok(config)
        }
    }

    /// `~/.config/mc-logstream/config.toml`
    pub fn config_path() -> Result<PathBuf> {
        let base_dirs = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))?;
        Ok(base_dirs.home_dir().join(".config/mc-logstream/config.toml"))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    pub fn to_server_config(&self) -> ServerConfig {
        let s = &self.server;
        ServerConfig {
            host: s.host.clone(),
            port: s.port,
            log_path: s.log_path.clone(),
            heartbeat_interval: Duration::from_secs(s.heartbeat_interval_secs.max(1)),
            client_timeout: Duration::from_secs(s.client_timeout_secs),
            write_timeout: Duration::from_secs(s.write_timeout_secs),
            queue_capacity: s.queue_capacity,
            tailer: TailerConfig {
                poll_interval: Duration::from_millis(s.poll_interval_ms),
                stat_every: s.stat_every,
                reopen_backoff: Duration::from_millis(s.reopen_backoff_ms),
                max_line_len: s.max_line_len,
            },
        }
    }

    pub fn to_client_config(&self) -> ClientConfig {
        let c = &self.client;
        ClientConfig {
            host: c.host.clone(),
            port: c.port,
            connect_timeout: Duration::from_secs(c.connect_timeout_secs),
            read_timeout: Duration::from_millis(c.read_timeout_ms),
            heartbeat_timeout: Duration::from_secs(c.heartbeat_timeout_secs),
            write_timeout: Duration::from_secs(c.write_timeout_secs),
            retry_interval: Duration::from_secs(c.retry_interval_secs),
            max_attempts: c.max_attempts,
            dispatch_capacity: c.dispatch_capacity,
        }
    }

    pub fn to_probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            connect_timeout: Duration::from_secs(self.client.probe_connect_timeout_secs),
            read_window: Duration::from_secs(self.client.probe_read_window_secs),
        }
    }
}
