//! Layered configuration for the `rill` binary.
//!
//! Precedence, lowest first: built-in defaults, `rill.toml`, `RILL_*`
//! environment variables, command-line flags.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rill_stream::types::duration_millis;
use serde::{Deserialize, Serialize};

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "rill.toml";

/// File holding the persisted broker state inside the data directory.
pub const SNAPSHOT_FILE: &str = "broker.json";

pub const ENV_DATA_DIR: &str = "RILL_DATA_DIR";
pub const ENV_LOG: &str = "RILL_LOG";
pub const ENV_CONFIRM_TIMEOUT_MS: &str = "RILL_CONFIRM_TIMEOUT_MS";
pub const ENV_WAIT_SECS: &str = "RILL_WAIT_SECS";

/// Settings shared by every subcommand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RillConfig {
    /// Directory holding the broker snapshot.
    pub data_dir: PathBuf,

    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,

    /// How long a producer waits for each append to be confirmed. Zero waits forever.
    #[serde(rename = "confirm_timeout_ms", with = "duration_millis")]
    pub confirm_timeout: Duration,

    /// How long `publish` waits for confirmations and `consume` waits for records.
    #[serde(rename = "wait_secs", with = "duration_secs")]
    pub wait: Duration,
}

impl Default for RillConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".rill"),
            log_level: "info".to_string(),
            confirm_timeout: Duration::from_secs(30),
            wait: Duration::from_secs(60),
        }
    }
}

impl RillConfig {
    /// Load defaults, then the config file, then the process environment.
    ///
    /// An explicit `path` must exist. Without one, `rill.toml` in the working
    /// directory is used when present.
    ///
    /// # Errors
    /// Fails when the file cannot be read or parsed, or when an environment
    /// variable holds an invalid number.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.is_file() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.with_env(|key| std::env::var(key).ok())
    }

    /// Parse a TOML config file. Missing keys keep their defaults.
    ///
    /// # Errors
    /// Fails when the file cannot be read or is not valid TOML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `RILL_*` variables resolved through `lookup`.
    ///
    /// # Errors
    /// Fails when a numeric variable does not parse.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup(ENV_LOG) {
            self.log_level = level;
        }
        if let Some(millis) = lookup(ENV_CONFIRM_TIMEOUT_MS) {
            let millis: u64 = millis
                .trim()
                .parse()
                .with_context(|| format!("{ENV_CONFIRM_TIMEOUT_MS} must be a number of milliseconds"))?;
            self.confirm_timeout = Duration::from_millis(millis);
        }
        if let Some(secs) = lookup(ENV_WAIT_SECS) {
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("{ENV_WAIT_SECS} must be a number of seconds"))?;
            self.wait = Duration::from_secs(secs);
        }
        Ok(self)
    }

    /// Apply command-line overrides.
    #[must_use]
    pub fn with_overrides(mut self, data_dir: Option<PathBuf>, log_level: Option<String>) -> Self {
        if let Some(dir) = data_dir {
            self.data_dir = dir;
        }
        if let Some(level) = log_level {
            self.log_level = level;
        }
        self
    }

    /// Location of the broker snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
