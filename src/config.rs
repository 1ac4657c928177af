//! Pipeline configuration and environment overrides.

use std::env;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::{parse_timestamp_ms, NormalizeConfig};
use crate::features::FeatureAggregationConfig;
use crate::sampling::DownsampleConfig;
use crate::snapshots::SnapshotConfig;

pub const ENV_SNAPSHOT_SEED: &str = "CHURN_SNAPSHOT_SEED";
pub const ENV_TRAIN_END: &str = "CHURN_TRAIN_END";
pub const ENV_DOWNSAMPLE_FRACTION: &str = "CHURN_DOWNSAMPLE_FRACTION";
pub const ENV_DOWNSAMPLE_MIN_EVENTS: &str = "CHURN_DOWNSAMPLE_MIN_EVENTS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub normalize: NormalizeConfig,
    /// `None` keeps every user regardless of log size.
    pub downsample: Option<DownsampleConfig>,
    pub snapshots: SnapshotConfig,
    pub features: FeatureAggregationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            normalize: NormalizeConfig::default(),
            downsample: Some(DownsampleConfig::default()),
            snapshots: SnapshotConfig::default(),
            features: FeatureAggregationConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.snapshots.seed = seed;
        if let Some(downsample) = self.downsample.as_mut() {
            downsample.seed = seed;
        }
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

/// Default config with environment overrides applied. Unset or blank
/// variables keep their defaults; malformed ones are rejected.
pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig::default();

    if let Some(raw) = read_var(ENV_SNAPSHOT_SEED) {
        let seed = raw
            .parse::<u64>()
            .map_err(|_| invalid(ENV_SNAPSHOT_SEED, &raw))?;
        config = config.with_seed(seed);
    }

    if let Some(raw) = read_var(ENV_TRAIN_END) {
        let (train_end, _) = parse_timestamp_ms(&raw).ok_or_else(|| invalid(ENV_TRAIN_END, &raw))?;
        config.snapshots.train_end_ts_ms_utc = Some(train_end);
    }

    if let Some(raw) = read_var(ENV_DOWNSAMPLE_FRACTION) {
        if matches!(raw.to_ascii_lowercase().as_str(), "off" | "none") {
            config.downsample = None;
        } else {
            let fraction = raw
                .parse::<f64>()
                .ok()
                .filter(|f| *f > 0.0 && *f <= 1.0)
                .ok_or_else(|| invalid(ENV_DOWNSAMPLE_FRACTION, &raw))?;
            if let Some(downsample) = config.downsample.as_mut() {
                downsample.fraction = fraction;
            }
        }
    }

    if let Some(raw) = read_var(ENV_DOWNSAMPLE_MIN_EVENTS) {
        let min_events = raw
            .parse::<usize>()
            .map_err(|_| invalid(ENV_DOWNSAMPLE_MIN_EVENTS, &raw))?;
        if let Some(downsample) = config.downsample.as_mut() {
            downsample.min_events = min_events;
        }
    }

    Ok(config)
}

fn read_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn invalid(var: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    const ALL_VARS: [&str; 4] = [
        ENV_SNAPSHOT_SEED,
        ENV_TRAIN_END,
        ENV_DOWNSAMPLE_FRACTION,
        ENV_DOWNSAMPLE_MIN_EVENTS,
    ];

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let previous: Vec<(String, Option<String>)> = ALL_VARS
            .iter()
            .map(|key| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for key in ALL_VARS {
            env::remove_var(key);
        }
        for (key, value) in vars {
            if let Some(v) = value {
                env::set_var(key, v);
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(&[], pipeline_config_from_env).unwrap();

        assert_eq!(cfg.snapshots.seed, 42);
        assert_eq!(cfg.snapshots.train_end_ts_ms_utc, None);
        assert_eq!(cfg.downsample, Some(DownsampleConfig::default()));
        assert_eq!(cfg.features, FeatureAggregationConfig::default());
    }

    #[test]
    fn parses_seed_train_end_and_downsampling() {
        let cfg = with_env_vars(
            &[
                (ENV_SNAPSHOT_SEED, Some("7")),
                (ENV_TRAIN_END, Some("2018-11-20T00:00:00Z")),
                (ENV_DOWNSAMPLE_FRACTION, Some("0.5")),
                (ENV_DOWNSAMPLE_MIN_EVENTS, Some("1000")),
            ],
            pipeline_config_from_env,
        )
        .unwrap();

        assert_eq!(cfg.snapshots.seed, 7);
        assert_eq!(cfg.snapshots.train_end_ts_ms_utc, Some(1_542_672_000_000));
        let downsample = cfg.downsample.unwrap();
        assert_eq!(downsample.seed, 7);
        assert_eq!(downsample.fraction, 0.5);
        assert_eq!(downsample.min_events, 1000);
    }

    #[test]
    fn downsampling_can_be_switched_off() {
        let cfg = with_env_vars(
            &[(ENV_DOWNSAMPLE_FRACTION, Some("off"))],
            pipeline_config_from_env,
        )
        .unwrap();
        assert_eq!(cfg.downsample, None);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = with_env_vars(
            &[(ENV_SNAPSHOT_SEED, Some("forty-two"))],
            pipeline_config_from_env,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                var: ENV_SNAPSHOT_SEED,
                value: "forty-two".to_string(),
            }
        );

        let err = with_env_vars(
            &[(ENV_DOWNSAMPLE_FRACTION, Some("1.5"))],
            pipeline_config_from_env,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: ENV_DOWNSAMPLE_FRACTION,
                ..
            }
        ));
    }
}
