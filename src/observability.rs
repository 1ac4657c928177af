//! Logging setup for feature-building runs.
//!
//! Every stage logs through `tracing` with `component` and `event` fields;
//! this module only decides how those records are rendered.

use std::env;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;

pub const ENV_LOG_LEVEL: &str = "CHURN_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "CHURN_LOG_FORMAT";
pub const ENV_LOG_TARGET: &str = "CHURN_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            include_target: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: env::var(ENV_LOG_LEVEL)
            .ok()
            .map(|level| level.trim().to_string())
            .filter(|level| !level.is_empty())
            .unwrap_or(defaults.level),
        format: env::var(ENV_LOG_FORMAT)
            .ok()
            .and_then(|raw| parse_log_format(&raw))
            .unwrap_or(defaults.format),
        include_target: env::var(ENV_LOG_TARGET)
            .ok()
            .and_then(|raw| parse_bool(&raw))
            .unwrap_or(defaults.include_target),
    }
}

/// Installs the global subscriber. Logs go to stderr so feature tables can
/// be streamed to stdout.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_writer(std::io::stderr)
        .with_ansi(!matches!(config.format, LogFormat::Json));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
        LogFormat::Compact => tracing::subscriber::set_global_default(builder.compact().finish())?,
    }

    Ok(())
}

pub fn log_run_start(config: &LoggingConfig, pipeline: &PipelineConfig) {
    info!(
        component = "pipeline",
        event = "run.start",
        log_level = %config.level,
        log_format = ?config.format,
        seed = pipeline.snapshots.seed,
        train_end_ts_ms_utc = ?pipeline.snapshots.train_end_ts_ms_utc,
        downsample_fraction = ?pipeline.downsample.as_ref().map(|d| d.fraction),
        windows_days = ?pipeline.features.windows_days
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        "compact" | "text" => Some(LogFormat::Compact),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn config_with(level: Option<&str>, format: Option<&str>, target: Option<&str>) -> LoggingConfig {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let vars = [
            (ENV_LOG_LEVEL, level),
            (ENV_LOG_FORMAT, format),
            (ENV_LOG_TARGET, target),
        ];
        let previous: Vec<_> = vars.iter().map(|(key, _)| (*key, env::var(key).ok())).collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        let config = logging_config_from_env();
        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        config
    }

    #[test]
    fn unset_env_yields_compact_info() {
        assert_eq!(config_with(None, None, None), LoggingConfig::default());
    }

    #[test]
    fn env_overrides_each_field() {
        let cfg = config_with(Some(" churn_features=debug "), Some("JSON"), Some("yes"));
        assert_eq!(cfg.level, "churn_features=debug");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(cfg.include_target);
    }

    #[test]
    fn unknown_words_keep_defaults() {
        let cfg = config_with(Some(""), Some("xml"), Some("sometimes"));
        assert_eq!(cfg, LoggingConfig::default());
    }
}
