//! Wiring from configuration to store, sink and finalizer handles.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sz_core::{DeviceLogs, Finalizer, FinalizerConfig, LogSink, Sink};
use sz_db::Database;
use sz_sink::HttpSink;

use crate::Config;

/// Load config and open database, ensuring the parent directory exists.
pub fn open_database(config_path: Option<&Path>) -> Result<(Arc<Database>, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    Ok((Arc::new(db), config))
}

/// Device log adapter over the database.
pub fn device_logs(db: &Arc<Database>, config: &Config) -> DeviceLogs {
    DeviceLogs::new(db.clone(), config.namespace())
}

/// The configured sink: HTTP when `sink_url` is set, the log otherwise.
pub fn build_sink(config: &Config) -> Result<Arc<dyn Sink>> {
    match &config.sink_url {
        Some(url) => {
            let sink = HttpSink::new(url, config.sink_token.clone(), config.sink_timeout())
                .context("failed to configure HTTP sink")?;
            tracing::debug!(?sink, "using HTTP sink");
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(LogSink)),
    }
}

/// Finalizer settings, with a lease long enough for the configured retries
/// against the configured sink timeout.
pub fn finalizer_config(config: &Config) -> FinalizerConfig {
    let retry = config.retry_policy();
    FinalizerConfig {
        namespace: config.namespace(),
        session_delay: config.session_delay(),
        lease: FinalizerConfig::lease_covering(&retry, config.sink_timeout()),
        retry,
    }
}

/// A finalizer using the database as both event store and journal.
pub fn build_finalizer(db: &Arc<Database>, config: &Config) -> Result<Finalizer> {
    let sink = build_sink(config)?;
    Ok(Finalizer::new(db.clone(), sink, db.clone(), finalizer_config(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeDelta;

    #[test]
    fn lease_grows_with_sink_timeout_and_retries() {
        let config = Config::default();
        assert_eq!(finalizer_config(&config).lease, TimeDelta::minutes(5));

        let slow = Config {
            sink_timeout_secs: 60,
            retry_max_attempts: 5,
            ..Config::default()
        };
        // Each of the 3 steps gets 5 attempts of up to 60s plus 5s backoff.
        assert_eq!(finalizer_config(&slow).lease, TimeDelta::seconds(3 * 5 * 65));
    }
}
