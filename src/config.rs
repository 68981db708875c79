//! Process configuration.
//!
//! Every option can be given as a flag or through its environment variable.

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::storage::{QueryLimits, SqliteOptions};

const SECONDS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Temperature and humidity history service")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 10000)]
    pub port: u16,

    /// Shared secret required for ingest. Empty leaves ingest open.
    #[arg(long, env = "API_KEY", default_value = "changeme", hide_env_values = true)]
    pub api_key: String,

    /// SQLite connection string (`sqlite://path`, a path, or `:memory:`).
    /// Readings are kept in memory when unset.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Days a stored reading is kept by the database backend. 0 keeps readings forever.
    #[arg(long, env = "TTL_DAYS", default_value_t = 0.0)]
    pub ttl_days: f64,

    /// Readings kept by the in-memory backend
    #[arg(long, env = "MAX_READINGS", default_value_t = 5000)]
    pub max_readings: usize,

    /// Readings returned by /api/history when no limit is given
    #[arg(long, env = "HISTORY_DEFAULT_LIMIT", default_value_t = 200)]
    pub history_default_limit: usize,

    /// Upper bound on readings returned by /api/history
    #[arg(long, env = "HISTORY_MAX_LIMIT", default_value_t = 2000)]
    pub history_max_limit: usize,

    /// Seconds between retention sweeps
    #[arg(long, env = "RETENTION_SWEEP_SECS", default_value_t = 60)]
    pub retention_sweep_secs: u64,

    /// Timeout for a single database operation, in milliseconds
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 15000)]
    pub store_timeout_ms: u64,

    /// Directory with the dashboard's static files
    #[arg(long, env = "STATIC_DIR", default_value = "public")]
    pub static_dir: PathBuf,
}

/// A configuration value that cannot be used.
#[derive(Debug, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl Config {
    /// Checks values clap cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |field, message: &str| {
            Err(ConfigError {
                field,
                message: message.to_string(),
            })
        };

        if !self.ttl_days.is_finite() || self.ttl_days < 0.0 {
            return fail("ttl_days", "must be a non-negative number");
        }
        if Duration::try_from_secs_f64(self.ttl_days * SECONDS_PER_DAY).is_err() {
            return fail("ttl_days", "is too large");
        }
        if self.max_readings == 0 {
            return fail("max_readings", "must be at least 1");
        }
        if self.history_default_limit == 0 {
            return fail("history_default_limit", "must be at least 1");
        }
        if self.history_max_limit == 0 {
            return fail("history_max_limit", "must be at least 1");
        }
        if self.history_default_limit > self.history_max_limit {
            return fail("history_default_limit", "must not exceed history_max_limit");
        }
        if self.retention_sweep_secs == 0 {
            return fail("retention_sweep_secs", "must be at least 1");
        }
        if self.store_timeout_ms == 0 {
            return fail("store_timeout_ms", "must be at least 1");
        }
        Ok(())
    }

    /// The database connection string, unless unset or blank.
    pub fn database_url(&self) -> Option<&str> {
        self.database_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn retention(&self) -> Option<Duration> {
        if self.ttl_days > 0.0 {
            Duration::try_from_secs_f64(self.ttl_days * SECONDS_PER_DAY).ok()
        } else {
            None
        }
    }

    pub fn query_limits(&self) -> QueryLimits {
        QueryLimits {
            default: self.history_default_limit,
            max: self.history_max_limit,
        }
    }

    pub fn sqlite_options(&self) -> SqliteOptions {
        SqliteOptions {
            limits: self.query_limits(),
            retention: self.retention(),
            operation_timeout: Duration::from_millis(self.store_timeout_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("climate-history").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--port",
            "8080",
            "--database-url",
            "sqlite://data/readings.db",
            "--ttl-days",
            "0.5",
            "--max-readings",
            "3",
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.database_url(), Some("sqlite://data/readings.db"));
        assert_eq!(config.retention(), Some(Duration::from_secs(12 * 60 * 60)));
        assert_eq!(config.max_readings, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let config = parse(&[
            "--history-default-limit",
            "500",
            "--history-max-limit",
            "100",
        ]);
        assert_eq!(config.validate().unwrap_err().field, "history_default_limit");

        let config = parse(&["--max-readings", "0"]);
        assert_eq!(config.validate().unwrap_err().field, "max_readings");

        let config = parse(&["--ttl-days=-1"]);
        assert_eq!(config.validate().unwrap_err().field, "ttl_days");

        let config = parse(&["--ttl-days", "1e20"]);
        assert_eq!(config.validate().unwrap_err().field, "ttl_days");
        assert_eq!(config.retention(), None);

        let config = parse(&["--history-max-limit", "0"]);
        assert_eq!(config.validate().unwrap_err().field, "history_max_limit");

        let config = parse(&["--history-default-limit", "0"]);
        assert_eq!(config.validate().unwrap_err().field, "history_default_limit");
    }

    #[test]
    fn test_blank_database_url_means_memory() {
        let config = parse(&["--database-url", "  "]);
        assert_eq!(config.database_url(), None);
        assert_eq!(config.retention(), None);
    }
}
