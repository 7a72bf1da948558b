//! Application configuration loaded from environment variables.

use std::time::Duration;

use outbox::{ClaimSettings, DispatcherConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Process configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `json` for JSON logs, anything else for human-readable ones
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory stores when unset
/// - `OUTBOX_POLL_INTERVAL_MS`, `OUTBOX_BATCH_SIZE`, `OUTBOX_MAX_ATTEMPTS`:
///   dispatcher tuning
/// - `OUTBOX_CLAIM_LEASE_SECS`, `OUTBOX_WORKER_ID`: lease batches to this
///   worker so several processes can share one outbox
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub dispatcher: DispatcherConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    ///
    /// Unparseable numbers fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let mut dispatcher = defaults.dispatcher;
        if let Some(ms) = parsed("OUTBOX_POLL_INTERVAL_MS") {
            dispatcher.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parsed("OUTBOX_BATCH_SIZE").filter(|&n| n > 0) {
            dispatcher.batch_size = usize::try_from(size).unwrap_or(dispatcher.batch_size);
        }
        if let Some(max) = parsed("OUTBOX_MAX_ATTEMPTS").filter(|&n| n > 0) {
            dispatcher.max_attempts = u32::try_from(max).unwrap_or(dispatcher.max_attempts);
        }
        if let Some(secs) = parsed("OUTBOX_CLAIM_LEASE_SECS").filter(|&n| n > 0) {
            dispatcher.claim = Some(ClaimSettings {
                worker_id: lookup("OUTBOX_WORKER_ID")
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("dispatcher-{}", std::process::id())),
                lease: Duration::from_secs(secs),
            });
        }

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            dispatcher,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            dispatcher: DispatcherConfig::default(),
        }
    }
}
