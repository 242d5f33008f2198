//! Runtime settings.
//!
//! Every section deserializes with `#[serde(default)]` so a partial or
//! missing config file still yields a working configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub operations: OperationSettings,
    pub rate_limit: RateLimitSettings,
    pub auth: AuthSettings,
}

impl CoreConfig {
    /// Load settings from a JSON file, falling back to defaults when the
    /// file is missing or unreadable. A corrupt file is logged and
    /// ignored rather than aborting startup.
    pub fn load(path: &Path) -> CoreConfig {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return CoreConfig::default(),
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config file is not valid JSON, using defaults"
                );
                CoreConfig::default()
            }
        }
    }
}

/// Settings for the operation registry and its timeout monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationSettings {
    /// Seconds between background timeout sweeps.
    pub poll_interval_secs: u64,
    /// Seconds a finished operation stays visible before pruning.
    pub retention_secs: u64,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            retention_secs: 3600,
        }
    }
}

impl OperationSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Settings for the login rate limiter. Field names match the on-disk
/// snapshot, which embeds a copy of this struct under `config`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub max_attempts: u32,
    pub window_seconds: u64,
    pub lockout_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_seconds: 300,
            lockout_seconds: 900,
        }
    }
}

/// Settings for credential verification against the Users table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Remote table holding user records.
    pub users_table: String,
    /// Failed attempts tolerated per username before the local lockout.
    pub max_attempts: u32,
    /// Seconds a failed attempt counts against the lockout.
    pub lockout_window_secs: u64,
    /// Token required by the administrative password reset. Resets are
    /// refused entirely when unset.
    pub admin_token: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            users_table: "Users".into(),
            max_attempts: 5,
            lockout_window_secs: 300,
            admin_token: None,
        }
    }
}
