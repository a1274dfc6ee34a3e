//! Configuration loaded from `config.toml`.
//!
//! Every field has a default so an empty (or missing) file yields a usable config.

use crate::error::PairgateError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// HTTP facade settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Bearer token required on every route. Empty disables auth.
    #[serde(default)]
    pub api_key: String,
}

/// Session database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Days a persisted session stays valid.
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: i64,
    /// Version-history rows kept per key.
    #[serde(default = "default_retention_versions")]
    pub retention_versions: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Expired records are deleted once they are this many days past expiry.
    #[serde(default = "default_expired_grace_days")]
    pub expired_grace_days: i64,
}

/// Linking workflow timings and budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,
    #[serde(default = "default_pair_settle_ms")]
    pub pair_settle_ms: u64,
    #[serde(default = "default_artifact_timeout_secs")]
    pub artifact_timeout_secs: u64,
    #[serde(default = "default_link_timeout_secs")]
    pub link_timeout_secs: u64,
    #[serde(default = "default_creds_wait_attempts")]
    pub creds_wait_attempts: u32,
    #[serde(default = "default_creds_wait_interval_ms")]
    pub creds_wait_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Send the session id back to the linked account once persisted.
    #[serde(default = "default_true")]
    pub send_confirmation: bool,
    /// How long a persisted attempt keeps listening for credential updates.
    #[serde(default = "default_persist_linger_ms")]
    pub persist_linger_ms: u64,
}

/// External messaging-library bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Program and leading arguments. The store directory is appended.
    #[serde(default = "default_bridge_command")]
    pub command: Vec<String>,
    #[serde(default = "default_bridge_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_data_dir() -> String {
    "~/.pairgate".to_string()
}
fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    5000
}
fn default_db_path() -> String {
    "~/.pairgate/pairgate.db".to_string()
}
fn default_session_ttl_days() -> i64 {
    90
}
fn default_retention_versions() -> i64 {
    5
}
fn default_sweep_interval_secs() -> u64 {
    3600
}
fn default_expired_grace_days() -> i64 {
    7
}
fn default_sessions_dir() -> String {
    "~/.pairgate/sessions".to_string()
}
fn default_pair_settle_ms() -> u64 {
    3000
}
fn default_artifact_timeout_secs() -> u64 {
    60
}
fn default_link_timeout_secs() -> u64 {
    180
}
fn default_creds_wait_attempts() -> u32 {
    5
}
fn default_creds_wait_interval_ms() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    2000
}
fn default_persist_linger_ms() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}
fn default_bridge_command() -> Vec<String> {
    vec!["node".to_string(), "bridge/baileys-bridge.mjs".to_string()]
}
fn default_bridge_request_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api: ApiConfig::default(),
            memory: MemoryConfig::default(),
            link: LinkConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            api_key: String::new(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            session_ttl_days: default_session_ttl_days(),
            retention_versions: default_retention_versions(),
            sweep_interval_secs: default_sweep_interval_secs(),
            expired_grace_days: default_expired_grace_days(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            sessions_dir: default_sessions_dir(),
            pair_settle_ms: default_pair_settle_ms(),
            artifact_timeout_secs: default_artifact_timeout_secs(),
            link_timeout_secs: default_link_timeout_secs(),
            creds_wait_attempts: default_creds_wait_attempts(),
            creds_wait_interval_ms: default_creds_wait_interval_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            send_confirmation: default_true(),
            persist_linger_ms: default_persist_linger_ms(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            request_timeout_secs: default_bridge_request_timeout_secs(),
        }
    }
}

impl LinkConfig {
    pub fn pair_settle(&self) -> Duration {
        Duration::from_millis(self.pair_settle_ms)
    }

    pub fn artifact_timeout(&self) -> Duration {
        Duration::from_secs(self.artifact_timeout_secs)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_secs(self.link_timeout_secs)
    }

    pub fn creds_wait_interval(&self) -> Duration {
        Duration::from_millis(self.creds_wait_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn persist_linger(&self) -> Duration {
        Duration::from_millis(self.persist_linger_ms)
    }
}

impl Config {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &str) -> Result<Self, PairgateError> {
        let path = shellexpand(path);
        if !Path::new(&path).exists() {
            info!("no config at {path}, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| PairgateError::Config(format!("failed to read {path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self, PairgateError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| PairgateError::Config(format!("invalid config: {e}")))?;

        if config.bridge.command.is_empty() {
            return Err(PairgateError::Config(
                "bridge.command must name a program".into(),
            ));
        }
        if config.memory.retention_versions < 1 {
            return Err(PairgateError::Config(
                "memory.retention_versions must be at least 1".into(),
            ));
        }

        Ok(config)
    }
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}
