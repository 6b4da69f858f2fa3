//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use sz_core::{KeyNamespace, RetryPolicy};

/// Cap on the backoff between retries of one step.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Longest accepted scheduler interval.
const MAX_INTERVAL_SECS: u64 = 86_400;

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Namespace token prefixed to device log keys.
    pub key_namespace: String,
    /// Idle time before a session is finalized.
    pub session_delay_secs: u64,
    /// Scheduler cadence.
    pub tick_interval_secs: u64,
    /// How often `sz run` resumes pending workflows and prunes the journal.
    pub recover_interval_secs: u64,
    /// Age after which completed workflows are pruned.
    pub journal_retention_secs: u64,
    /// Attempts per workflow step for transient failures.
    pub retry_max_attempts: u32,
    /// Initial retry backoff; doubled per attempt.
    pub retry_backoff_ms: u64,
    /// HTTP endpoint for finalized sessions. Sessions are logged when unset.
    pub sink_url: Option<String>,
    /// Bearer token for the sink endpoint.
    pub sink_token: Option<String>,
    pub sink_timeout_secs: u64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("key_namespace", &self.key_namespace)
            .field("session_delay_secs", &self.session_delay_secs)
            .field("tick_interval_secs", &self.tick_interval_secs)
            .field("recover_interval_secs", &self.recover_interval_secs)
            .field("journal_retention_secs", &self.journal_retention_secs)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("sink_url", &self.sink_url)
            .field("sink_token", &self.sink_token.as_ref().map(|_| "[REDACTED]"))
            .field("sink_timeout_secs", &self.sink_timeout_secs)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("sz.db"),
            key_namespace: "device".to_string(),
            session_delay_secs: 30,
            tick_interval_secs: 5,
            recover_interval_secs: 60,
            journal_retention_secs: 86_400,
            retry_max_attempts: 3,
            retry_backoff_ms: 200,
            sink_url: None,
            sink_token: None,
            sink_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Loads configuration from default locations.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(None)
    }

    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (SZ_*)
        figment = figment.merge(Env::prefixed("SZ_"));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    fn validate(&self) -> Result<(), figment::Error> {
        if !(1..=MAX_INTERVAL_SECS).contains(&self.tick_interval_secs) {
            return Err(format!("tick_interval_secs must be between 1 and {MAX_INTERVAL_SECS}").into());
        }
        if !(1..=MAX_INTERVAL_SECS).contains(&self.recover_interval_secs) {
            return Err(
                format!("recover_interval_secs must be between 1 and {MAX_INTERVAL_SECS}").into(),
            );
        }
        if self.retry_max_attempts == 0 {
            return Err("retry_max_attempts must be at least 1".to_string().into());
        }
        if self.sink_timeout_secs == 0 {
            return Err("sink_timeout_secs must be at least 1".to_string().into());
        }
        if seconds(self.session_delay_secs).is_none() {
            return Err("session_delay_secs is too large".to_string().into());
        }
        if seconds(self.journal_retention_secs).is_none() {
            return Err("journal_retention_secs is too large".to_string().into());
        }
        KeyNamespace::new(self.key_namespace.clone())
            .map_err(|err| figment::Error::from(format!("key_namespace: {err}")))?;
        Ok(())
    }

    pub fn namespace(&self) -> KeyNamespace {
        KeyNamespace::new(self.key_namespace.clone()).unwrap_or_default()
    }

    pub fn session_delay(&self) -> TimeDelta {
        seconds(self.session_delay_secs).unwrap_or(TimeDelta::MAX)
    }

    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub const fn recover_interval(&self) -> Duration {
        Duration::from_secs(self.recover_interval_secs)
    }

    pub fn journal_retention(&self) -> TimeDelta {
        seconds(self.journal_retention_secs).unwrap_or(TimeDelta::MAX)
    }

    pub const fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: MAX_BACKOFF,
        }
    }
}

fn seconds(secs: u64) -> Option<TimeDelta> {
    i64::try_from(secs).ok().and_then(TimeDelta::try_seconds)
}

/// Returns the platform-specific config directory for sz.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("sz"))
}

/// Returns the platform-specific data directory for sz.
///
/// On Linux: `~/.local/share/sz`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("sz"))
}
