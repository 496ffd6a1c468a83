//! Store configuration via `sharedprefs.toml`
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. Values are validated eagerly on load.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use sharedprefs_concurrency::BatchLimits;
use sharedprefs_core::{Error, Origin, Result};

/// Config file name
pub const CONFIG_FILE_NAME: &str = "sharedprefs.toml";

/// Store configuration loaded from `sharedprefs.toml`.
///
/// # Example
///
/// ```toml
/// authority = "com.example.settings"
/// origin = "com.example.app"
/// lock_timeout_ms = 2000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrefsConfig {
    /// Authority used to build row and key addresses.
    #[serde(default = "default_authority")]
    pub authority: String,
    /// Identity stamped on inserted rows. Defaults to `pid-<process id>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Bulk-insert operations between automatic yield points.
    #[serde(default = "default_bulk_inserts_per_yield")]
    pub bulk_inserts_per_yield: usize,
    /// Cap on batch operations between two yield points.
    #[serde(default = "default_max_operations_per_yield")]
    pub max_operations_per_yield: usize,
    /// Every Nth operation of an editor commit may yield.
    #[serde(default = "default_commit_yield_interval")]
    pub commit_yield_interval: usize,
    /// Pause before re-acquiring the write lock after a yield.
    #[serde(default = "default_yield_sleep_ms")]
    pub yield_sleep_ms: u64,
    /// Bound on waiting for the write lock; unset waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_timeout_ms: Option<u64>,
    /// Extra warm-load attempts after a failure.
    #[serde(default)]
    pub load_retries: u32,
    /// Sleep between warm-load attempts.
    #[serde(default = "default_load_retry_backoff_ms")]
    pub load_retry_backoff_ms: u64,
    /// Thread name of the serial commit worker.
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
}

fn default_authority() -> String {
    "sharedprefs".to_string()
}

fn default_bulk_inserts_per_yield() -> usize {
    50
}

fn default_max_operations_per_yield() -> usize {
    500
}

fn default_commit_yield_interval() -> usize {
    100
}

fn default_yield_sleep_ms() -> u64 {
    4000
}

fn default_load_retry_backoff_ms() -> u64 {
    100
}

fn default_queue_name() -> String {
    "sharedprefs-commit".to_string()
}

impl Default for PrefsConfig {
    fn default() -> Self {
        Self {
            authority: default_authority(),
            origin: None,
            bulk_inserts_per_yield: default_bulk_inserts_per_yield(),
            max_operations_per_yield: default_max_operations_per_yield(),
            commit_yield_interval: default_commit_yield_interval(),
            yield_sleep_ms: default_yield_sleep_ms(),
            lock_timeout_ms: None,
            load_retries: 0,
            load_retry_backoff_ms: default_load_retry_backoff_ms(),
            queue_name: default_queue_name(),
        }
    }
}

impl PrefsConfig {
    /// Check the values against each other.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.authority.is_empty() {
            return Err(Error::Config("authority must not be empty".to_string()));
        }
        if self.bulk_inserts_per_yield == 0 {
            return Err(Error::Config(
                "bulk_inserts_per_yield must be at least 1".to_string(),
            ));
        }
        if self.commit_yield_interval == 0
            || self.commit_yield_interval >= self.max_operations_per_yield
        {
            return Err(Error::Config(format!(
                "commit_yield_interval must be in 1..{} (max_operations_per_yield), got {}",
                self.max_operations_per_yield, self.commit_yield_interval
            )));
        }
        if matches!(&self.origin, Some(o) if o.is_empty()) {
            return Err(Error::Config("origin must not be empty".to_string()));
        }
        Ok(())
    }

    /// Origin to stamp on inserts.
    pub fn origin(&self) -> Origin {
        match &self.origin {
            Some(name) => Origin::new(name.clone()),
            None => Origin::current_process(),
        }
    }

    /// Lock wait bound, if any.
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Batch protocol tunables.
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            bulk_inserts_per_yield: self.bulk_inserts_per_yield,
            max_operations_per_yield: self.max_operations_per_yield,
            yield_sleep: Duration::from_millis(self.yield_sleep_ms),
        }
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# SharedPrefs configuration
#
# Authority used in change-notification addresses
# ("<authority>/rows/<id>" and "<authority>/keys/<key>").
authority = "sharedprefs"

# Identity stamped on rows this process inserts. Only the origin that
# inserted a row may delete it. Defaults to "pid-<process id>".
# origin = "com.example.app"

# Batch protocol
bulk_inserts_per_yield = 50
max_operations_per_yield = 500
commit_yield_interval = 100
yield_sleep_ms = 4000

# Give up waiting for the store write lock after this many milliseconds.
# Unset waits forever.
# lock_timeout_ms = 5000

# Warm load retries (0 = a failed load leaves the cache unloaded)
load_retries = 0
load_retry_backoff_ms = 100

queue_name = "sharedprefs-commit"
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: PrefsConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
