//! Configuration for the admission engines.
//!
//! Parses a TOML file that names where each engine's store lives and the
//! defaults the orchestration layer applies when no explicit policy or
//! threshold exists. All fields are optional; an empty file yields a
//! working configuration rooted at the current directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level admission configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Directory holding the engine store files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Store file names, relative to `data_dir`.
    #[serde(default)]
    pub stores: StoreFiles,

    /// Defaults applied when creating rate-limit policies.
    #[serde(default)]
    pub rate_limit: RateLimitDefaults,

    /// Defaults applied when creating budget limits.
    #[serde(default)]
    pub budget: BudgetDefaults,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            stores: StoreFiles::default(),
            rate_limit: RateLimitDefaults::default(),
            budget: BudgetDefaults::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Store file names for the three persistent engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFiles {
    /// Request-ledger database file.
    #[serde(default = "default_ledger_file")]
    pub request_ledger: String,

    /// Rate-limiter database file.
    #[serde(default = "default_rate_limit_file")]
    pub rate_limit: String,

    /// Budget database file.
    #[serde(default = "default_budget_file")]
    pub budget: String,
}

impl Default for StoreFiles {
    fn default() -> Self {
        Self {
            request_ledger: default_ledger_file(),
            rate_limit: default_rate_limit_file(),
            budget: default_budget_file(),
        }
    }
}

fn default_ledger_file() -> String {
    "request_ledger.sqlite".to_string()
}

fn default_rate_limit_file() -> String {
    "rate_limit.sqlite".to_string()
}

fn default_budget_file() -> String {
    "budget.sqlite".to_string()
}

/// Defaults for rate-limit policies created from resolved group policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDefaults {
    /// Default base request limit per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Default window length in seconds.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Default burst allowance.
    #[serde(default)]
    pub burst_allowance: u32,
}

impl Default for RateLimitDefaults {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
            burst_allowance: 0,
        }
    }
}

fn default_max_requests() -> u32 {
    60
}

fn default_window_seconds() -> u64 {
    60
}

/// Default budget threshold ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetDefaults {
    /// Soft-alert percentage.
    #[serde(default = "default_soft_alert_pct")]
    pub soft_alert_pct: f64,

    /// Reauthorization percentage.
    #[serde(default = "default_reauth_pct")]
    pub reauth_pct: f64,

    /// Hard-stop percentage.
    #[serde(default = "default_hard_stop_pct")]
    pub hard_stop_pct: f64,
}

impl Default for BudgetDefaults {
    fn default() -> Self {
        Self {
            soft_alert_pct: default_soft_alert_pct(),
            reauth_pct: default_reauth_pct(),
            hard_stop_pct: default_hard_stop_pct(),
        }
    }
}

fn default_soft_alert_pct() -> f64 {
    80.0
}

fn default_reauth_pct() -> f64 {
    100.0
}

fn default_hard_stop_pct() -> f64 {
    120.0
}

impl AdmissionConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not valid TOML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Absolute-or-relative path of the request-ledger store.
    #[must_use]
    pub fn request_ledger_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.stores.request_ledger)
    }

    /// Path of the rate-limiter store.
    #[must_use]
    pub fn rate_limit_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.stores.rate_limit)
    }

    /// Path of the budget store.
    #[must_use]
    pub fn budget_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.stores.budget)
    }
}
