use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_FLUSH_INTERVAL_MS: &str = "IOPUB_FLUSH_INTERVAL_MS";
const ENV_FLUSH_TIMEOUT_MS: &str = "IOPUB_FLUSH_TIMEOUT_MS";
const ENV_PIPE: &str = "IOPUB_PIPE";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoPubConfig {
    /// Delay between the first unflushed write and its automatic flush.
    pub flush_interval_ms: u64,
    /// How long `flush()` waits for the worker before giving up.
    pub flush_timeout_ms: u64,
    /// Listen for output piped from forked descendants.
    pub pipe: bool,
    /// Redirect the OS descriptor behind each stream.
    pub watch_fd: bool,
    /// Connect/write budget for a descendant's pipe-out send.
    pub pipe_linger_ms: u64,
    /// Read size of the descriptor watcher.
    pub watch_chunk: usize,
    pub log_filter: String,
}

impl Default for IoPubConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 200,
            flush_timeout_ms: 10_000,
            pipe: false,
            watch_fd: false,
            pipe_linger_ms: 3_000,
            watch_chunk: 1000,
            log_filter: "iopub=info".to_string(),
        }
    }
}

impl IoPubConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn pipe_linger(&self) -> Duration {
        Duration::from_millis(self.pipe_linger_ms)
    }

    /// Apply `IOPUB_*` environment overrides. Unparseable values are ignored.
    pub fn from_env_overrides(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ms) = lookup(ENV_FLUSH_INTERVAL_MS).and_then(|v| v.trim().parse().ok()) {
            self.flush_interval_ms = ms;
        }
        if let Some(ms) = lookup(ENV_FLUSH_TIMEOUT_MS).and_then(|v| v.trim().parse().ok()) {
            self.flush_timeout_ms = ms;
        }
        if let Some(flag) = lookup(ENV_PIPE).and_then(|v| parse_flag(&v)) {
            self.pipe = flag;
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
        }
    }
}

/// Load a JSON config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<IoPubConfig, ConfigError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(IoPubConfig::default()),
        Err(e) => return Err(ConfigError::Io(e)),
    };
    serde_json::from_str(&data).map_err(ConfigError::Parse)
}

#[cfg(test)]
#[path = "../tests/unit/config.rs"]
mod tests;
