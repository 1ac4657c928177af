//! End-to-end table builds: raw events in, labeled feature table out.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::attributes::{extract_attributes, AttributedEvent};
use crate::config::PipelineConfig;
use crate::events::{normalize_events, NormalizeError, NormalizeReport, RawEventTable};
use crate::features::{aggregate_features, FeatureError, FeatureSchema, FeatureTable};
use crate::sampling::{downsample_users, DownsampleReport, SamplingError};
use crate::snapshots::{
    generate_snapshots, global_cutoff_snapshots, summarize_snapshots, Snapshot, SnapshotError,
    SnapshotSummary,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub normalize: NormalizeReport,
    pub downsample: DownsampleReport,
    pub snapshots: Vec<Snapshot>,
    pub snapshot_summary: SnapshotSummary,
    pub table: FeatureTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRun {
    pub normalize: NormalizeReport,
    pub cutoff_ts_ms_utc: Option<i64>,
    pub table: FeatureTable,
}

/// Snapshot-driven training table: every row carries the label of the
/// snapshot it was aggregated for.
pub fn build_training_table(
    raw: &RawEventTable,
    cfg: &PipelineConfig,
) -> Result<TrainingRun, PipelineError> {
    let (events, normalize, downsample) = prepare_events(raw, cfg, true)?;
    let snapshots = generate_snapshots(&events, &cfg.snapshots)?;
    let snapshot_summary = summarize_snapshots(&snapshots);
    let table = aggregate_features(&events, Some(&snapshots), &cfg.features)?;

    info!(
        component = "pipeline",
        event = "pipeline.training.finish",
        rows = table.rows.len(),
        positives = snapshot_summary.positives,
        negatives = snapshot_summary.negatives,
        fingerprint = %table.schema.fingerprint
    );

    Ok(TrainingRun {
        normalize,
        downsample,
        snapshots,
        snapshot_summary,
        table,
    })
}

/// One unlabeled row per user at the log's latest timestamp. With
/// `train_schema` the table is laid out exactly like the training table.
pub fn build_inference_table(
    raw: &RawEventTable,
    cfg: &PipelineConfig,
    train_schema: Option<&FeatureSchema>,
) -> Result<InferenceRun, PipelineError> {
    let (events, normalize, _) = prepare_events(raw, cfg, false)?;
    let snapshots = global_cutoff_snapshots(&events);
    let cutoff_ts_ms_utc = snapshots.first().map(|snapshot| snapshot.cutoff_ts_ms_utc);

    let table = aggregate_features(&events, Some(&snapshots), &cfg.features)?;
    let table = match train_schema {
        Some(schema) => table.align_to(schema),
        None => table,
    };

    info!(
        component = "pipeline",
        event = "pipeline.inference.finish",
        rows = table.rows.len(),
        cutoff_ts_ms_utc = ?cutoff_ts_ms_utc,
        aligned = train_schema.is_some()
    );

    Ok(InferenceRun {
        normalize,
        cutoff_ts_ms_utc,
        table,
    })
}

/// One row per user anchored at that user's last event, labeled by whether
/// the user ever cancelled. Kept for comparison with older models.
pub fn build_legacy_table(
    raw: &RawEventTable,
    cfg: &PipelineConfig,
) -> Result<FeatureTable, PipelineError> {
    let (events, _, _) = prepare_events(raw, cfg, true)?;
    Ok(aggregate_features(&events, None, &cfg.features)?)
}

fn prepare_events(
    raw: &RawEventTable,
    cfg: &PipelineConfig,
    allow_downsampling: bool,
) -> Result<(Vec<AttributedEvent>, NormalizeReport, DownsampleReport), PipelineError> {
    let (events, normalize) = normalize_events(raw, &cfg.normalize)?;

    let (events, downsample) = match cfg.downsample.as_ref().filter(|_| allow_downsampling) {
        Some(downsample_cfg) => downsample_users(events, downsample_cfg)?,
        None => {
            let users = events
                .iter()
                .map(|event| event.user_id.as_str())
                .collect::<HashSet<_>>()
                .len() as u64;
            let report = DownsampleReport {
                applied: false,
                input_events: events.len() as u64,
                output_events: events.len() as u64,
                input_users: users,
                output_users: users,
            };
            (events, report)
        }
    };

    Ok((extract_attributes(&events), normalize, downsample))
}
