use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::broker::{REQUESTS_QUEUE, RESULTS_QUEUE};
use crate::consumer::ConsumerSettings;
use crate::reconnect::ReconnectConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("expected 'text' or 'json', got '{other}'")),
        }
    }
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub amqp_url: String,
    /// Queue carrying completion results (default: `maps`).
    pub results_queue: String,
    /// Queue carrying render requests (default: `mapnik`).
    pub requests_queue: String,
    /// Directory under which artifacts are written (default: `files`).
    pub media_root: PathBuf,
    pub retention_sweep_interval: Duration,
    pub reconnect: ReconnectConfig,
    pub requeue_delay: Duration,
    pub metrics_log_interval: Duration,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default                     |
    /// |---------------------------------|-----------------------------|
    /// | `DATABASE_URL`                  | required                    |
    /// | `RABBITMQ_URL`                  | `amqp://localhost:5672/%2f` |
    /// | `RESULTS_QUEUE`                 | `maps`                      |
    /// | `REQUESTS_QUEUE`                | `mapnik`                    |
    /// | `MEDIA_ROOT`                    | `files`                     |
    /// | `RETENTION_SWEEP_INTERVAL_SECS` | `3600`                      |
    /// | `RECONNECT_INITIAL_DELAY_MS`    | `1000`                      |
    /// | `RECONNECT_MAX_DELAY_MS`        | `30000`                     |
    /// | `RECONNECT_MAX_ATTEMPTS`        | `10`                        |
    /// | `REQUEUE_DELAY_MS`              | `1000`                      |
    /// | `METRICS_LOG_INTERVAL_SECS`     | `300`                       |
    /// | `LOG_FORMAT`                    | `text` (or `json`)          |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`WorkerConfig::from_env`] but reading variables through
    /// `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let database_url = env
            .string("DATABASE_URL")
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(env.parse("RECONNECT_INITIAL_DELAY_MS", 1000)?),
            max_delay: Duration::from_millis(env.parse("RECONNECT_MAX_DELAY_MS", 30_000)?),
            max_attempts: env.parse("RECONNECT_MAX_ATTEMPTS", 10)?,
            ..ReconnectConfig::default()
        };
        if reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "RECONNECT_MAX_ATTEMPTS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let retention_secs: u64 = env.parse("RETENTION_SWEEP_INTERVAL_SECS", 3600)?;
        let metrics_secs: u64 = env.parse("METRICS_LOG_INTERVAL_SECS", 300)?;
        for (var, secs) in [
            ("RETENTION_SWEEP_INTERVAL_SECS", retention_secs),
            ("METRICS_LOG_INTERVAL_SECS", metrics_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var,
                    value: "0".into(),
                    reason: "interval must be positive".into(),
                });
            }
        }

        Ok(Self {
            database_url,
            amqp_url: env
                .string("RABBITMQ_URL")
                .unwrap_or_else(|| "amqp://localhost:5672/%2f".into()),
            results_queue: env
                .string("RESULTS_QUEUE")
                .unwrap_or_else(|| RESULTS_QUEUE.into()),
            requests_queue: env
                .string("REQUESTS_QUEUE")
                .unwrap_or_else(|| REQUESTS_QUEUE.into()),
            media_root: env
                .string("MEDIA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("files")),
            retention_sweep_interval: Duration::from_secs(retention_secs),
            reconnect,
            requeue_delay: Duration::from_millis(env.parse("REQUEUE_DELAY_MS", 1000)?),
            metrics_log_interval: Duration::from_secs(metrics_secs),
            log_format: env.parse("LOG_FORMAT", LogFormat::Text)?,
        })
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            queue: self.results_queue.clone(),
            reconnect: self.reconnect.clone(),
            requeue_delay: self.requeue_delay,
            metrics_log_interval: self.metrics_log_interval,
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// A set, non-blank variable.
    fn string(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(var) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }
}
