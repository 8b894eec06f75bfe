use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanwatchError};

pub const MIN_HISTORY_LIMIT: u32 = 10;
pub const MAX_HISTORY_LIMIT: u32 = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub cursor: CursorConfig,
}

impl CoordinatorConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            server: ServerConfig {
                base_url: base_url.into(),
                api_token: None,
                request_timeout_secs: None,
            },
            polling: PollingConfig::default(),
            cursor: CursorConfig::default(),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        serde_json::from_slice(&bytes).map_err(|err| {
            ScanwatchError::Decode(format!(
                "invalid config {}: {err}",
                path.as_ref().display()
            ))
        })
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let base_url = self.server.base_url.trim();
        if base_url.is_empty() {
            return Err(ConfigValidationError::MissingBaseUrl);
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigValidationError::InvalidBaseUrl(base_url.to_owned()));
        }
        self.polling.validate()?;
        if self.cursor.backend == KvBackendKind::Sled && self.cursor.path.is_none() {
            return Err(ConfigValidationError::MissingCursorPath);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Unset means the transport default (no timeout).
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollingConfig {
    pub slow_interval_ms: u64,
    pub fast_interval_ms: u64,
    pub scan_tick_ms: u64,
    pub settle_delay_ms: u64,
    pub history_limit: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            slow_interval_ms: 30_000,
            fast_interval_ms: 2_000,
            scan_tick_ms: 1_000,
            settle_delay_ms: 3_000,
            history_limit: 100,
        }
    }
}

impl PollingConfig {
    pub fn slow_interval(&self) -> Duration {
        Duration::from_millis(self.slow_interval_ms)
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_interval_ms)
    }

    pub fn scan_tick(&self) -> Duration {
        Duration::from_millis(self.scan_tick_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn clamped_history_limit(&self) -> u32 {
        self.history_limit.clamp(MIN_HISTORY_LIMIT, MAX_HISTORY_LIMIT)
    }

    fn validate(&self) -> Result<(), ConfigValidationError> {
        let intervals = [
            ("slow_interval_ms", self.slow_interval_ms),
            ("fast_interval_ms", self.fast_interval_ms),
            ("scan_tick_ms", self.scan_tick_ms),
        ];
        match intervals.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigValidationError::ZeroInterval(name)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CursorConfig {
    #[serde(default)]
    pub backend: KvBackendKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KvBackendKind {
    Sled,
    #[default]
    Memory,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("server base url must be provided")]
    MissingBaseUrl,
    #[error("server base url must be http(s): {0}")]
    InvalidBaseUrl(String),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("sled cursor backend requires a path")]
    MissingCursorPath,
}
