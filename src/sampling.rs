//! User-level downsampling of large event logs.
//!
//! Whole users are kept or dropped, so per-user aggregation is unaffected.

use std::collections::{BTreeSet, HashSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::events::Event;
use crate::snapshots::DEFAULT_SEED;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownsampleConfig {
    pub fraction: f64,
    pub seed: u64,
    /// Logs with at most this many events are returned untouched.
    pub min_events: usize,
}

impl Default for DownsampleConfig {
    fn default() -> Self {
        Self {
            fraction: 0.1,
            seed: DEFAULT_SEED,
            min_events: 100_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownsampleReport {
    pub applied: bool,
    pub input_events: u64,
    pub output_events: u64,
    pub input_users: u64,
    pub output_users: u64,
}

#[derive(Debug, Error, PartialEq)]
pub enum SamplingError {
    #[error("downsample fraction must be in (0, 1], got {0}")]
    InvalidFraction(f64),
}

pub fn downsample_users(
    events: Vec<Event>,
    cfg: &DownsampleConfig,
) -> Result<(Vec<Event>, DownsampleReport), SamplingError> {
    if !(cfg.fraction > 0.0 && cfg.fraction <= 1.0) {
        return Err(SamplingError::InvalidFraction(cfg.fraction));
    }

    let users: Vec<&str> = events
        .iter()
        .map(|event| event.user_id.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut report = DownsampleReport {
        applied: false,
        input_events: events.len() as u64,
        output_events: events.len() as u64,
        input_users: users.len() as u64,
        output_users: users.len() as u64,
    };

    if events.len() <= cfg.min_events {
        return Ok((events, report));
    }

    let keep_count = ((users.len() as f64 * cfg.fraction).round() as usize).clamp(1, users.len());
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let keep: HashSet<String> = users
        .choose_multiple(&mut rng, keep_count)
        .map(|user_id| user_id.to_string())
        .collect();

    let sampled: Vec<Event> = events
        .into_iter()
        .filter(|event| keep.contains(&event.user_id))
        .collect();

    report.applied = true;
    report.output_events = sampled.len() as u64;
    report.output_users = keep.len() as u64;

    info!(
        component = "sampling",
        event = "sampling.downsample.finish",
        fraction = cfg.fraction,
        input_users = report.input_users,
        output_users = report.output_users,
        input_events = report.input_events,
        output_events = report.output_events
    );

    Ok((sampled, report))
}
