//! Point-in-time training snapshot generation.
//!
//! Churned users get labeled snapshots shortly before and well before their
//! cancellation. Non-churned users get in-span snapshots plus dormancy
//! snapshots placed after their last event, so that inactivity alone is not
//! learned as a churn signal.

use std::collections::{BTreeMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::attributes::AttributedEvent;
use crate::events::DAY_MS;

pub const DEFAULT_SEED: u64 = 42;
pub const CHURN_PAGE: &str = "Cancellation Confirmation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SnapshotKind {
    /// Shortly before cancellation, positive.
    PreChurn,
    /// Long before cancellation, negative.
    EarlyNegative,
    /// Uniformly inside a non-churned user's active span.
    Random,
    /// At the last event of a user active for less than the minimum span.
    ActiveSpan,
    /// After a non-churned user's last event.
    Dormancy,
    /// Shared inference cutoff at the end of the log.
    GlobalCutoff,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Snapshot {
    pub user_id: String,
    pub cutoff_ts_ms_utc: i64,
    pub label: Option<u8>,
    pub kind: SnapshotKind,
}

impl Snapshot {
    pub fn labeled(
        user_id: impl Into<String>,
        cutoff_ts_ms_utc: i64,
        label: u8,
        kind: SnapshotKind,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            cutoff_ts_ms_utc,
            label: Some(label),
            kind,
        }
    }

    pub fn unlabeled(user_id: impl Into<String>, cutoff_ts_ms_utc: i64) -> Self {
        Self {
            user_id: user_id.into(),
            cutoff_ts_ms_utc,
            label: None,
            kind: SnapshotKind::GlobalCutoff,
        }
    }

    pub fn key(&self) -> (&str, i64) {
        (&self.user_id, self.cutoff_ts_ms_utc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub seed: u64,
    pub churn_page: String,
    pub positive_offsets_days: Vec<u32>,
    pub negative_offsets_days: Vec<u32>,
    pub random_snapshots: u32,
    pub min_active_span_ms: i64,
    pub dormancy_snapshots: u32,
    pub dormancy_max_days: u32,
    /// Snapshots with `cutoff >= train_end` are dropped when set.
    pub train_end_ts_ms_utc: Option<i64>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            churn_page: CHURN_PAGE.to_string(),
            positive_offsets_days: vec![1, 3, 7],
            negative_offsets_days: vec![30, 60],
            random_snapshots: 2,
            min_active_span_ms: 3_600_000,
            dormancy_snapshots: 3,
            dormancy_max_days: 45,
            train_end_ts_ms_utc: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub total: u64,
    pub positives: u64,
    pub negatives: u64,
    pub unlabeled: u64,
    pub users: u64,
    pub by_kind: BTreeMap<SnapshotKind, u64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("invalid snapshot config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy)]
struct UserSpan {
    first_ts_ms_utc: i64,
    last_ts_ms_utc: i64,
    churn_ts_ms_utc: Option<i64>,
}

pub fn generate_snapshots(
    events: &[AttributedEvent],
    cfg: &SnapshotConfig,
) -> Result<Vec<Snapshot>, SnapshotError> {
    validate_config(cfg)?;

    info!(
        component = "snapshots",
        event = "snapshots.generate.start",
        events = events.len(),
        seed = cfg.seed,
        train_end_ts_ms_utc = ?cfg.train_end_ts_ms_utc
    );

    let spans = user_spans(events, &cfg.churn_page);
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut snapshots = Vec::new();

    for (user_id, span) in &spans {
        match span.churn_ts_ms_utc {
            Some(churn_ts) => churned_snapshots(user_id, span, churn_ts, cfg, &mut snapshots),
            None => active_snapshots(user_id, span, cfg, &mut rng, &mut snapshots),
        }
    }

    let generated = snapshots.len();
    if let Some(train_end) = cfg.train_end_ts_ms_utc {
        snapshots.retain(|snapshot| snapshot.cutoff_ts_ms_utc < train_end);
    }
    let after_train_end = snapshots.len();

    snapshots.sort();
    snapshots.dedup_by(|a, b| a.key() == b.key());

    info!(
        component = "snapshots",
        event = "snapshots.generate.finish",
        users = spans.len(),
        generated,
        dropped_after_train_end = generated - after_train_end,
        dropped_duplicates = after_train_end - snapshots.len(),
        snapshots = snapshots.len()
    );

    Ok(snapshots)
}

/// One unlabeled snapshot per user at the latest timestamp in the whole log.
pub fn global_cutoff_snapshots(events: &[AttributedEvent]) -> Vec<Snapshot> {
    let Some(global_max) = events.iter().map(AttributedEvent::ts_ms_utc).max() else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut snapshots: Vec<Snapshot> = events
        .iter()
        .filter(|event| seen.insert(event.user_id()))
        .map(|event| Snapshot::unlabeled(event.user_id(), global_max))
        .collect();
    snapshots.sort();

    info!(
        component = "snapshots",
        event = "snapshots.global_cutoff.finish",
        cutoff_ts_ms_utc = global_max,
        snapshots = snapshots.len()
    );

    snapshots
}

pub fn summarize_snapshots(snapshots: &[Snapshot]) -> SnapshotSummary {
    let mut summary = SnapshotSummary::default();
    let mut users = HashSet::new();
    for snapshot in snapshots {
        summary.total += 1;
        match snapshot.label {
            Some(1) => summary.positives += 1,
            Some(_) => summary.negatives += 1,
            None => summary.unlabeled += 1,
        }
        *summary.by_kind.entry(snapshot.kind).or_default() += 1;
        users.insert(snapshot.user_id.as_str());
    }
    summary.users = users.len() as u64;
    summary
}

fn validate_config(cfg: &SnapshotConfig) -> Result<(), SnapshotError> {
    if cfg.churn_page.trim().is_empty() {
        return Err(SnapshotError::InvalidConfig(
            "churn_page must not be empty".to_string(),
        ));
    }

    if cfg
        .positive_offsets_days
        .iter()
        .chain(cfg.negative_offsets_days.iter())
        .any(|offset| *offset == 0)
    {
        return Err(SnapshotError::InvalidConfig(
            "snapshot offsets must be > 0 days".to_string(),
        ));
    }

    if cfg.dormancy_snapshots > 0 && cfg.dormancy_max_days == 0 {
        return Err(SnapshotError::InvalidConfig(
            "dormancy_max_days must be > 0 when dormancy snapshots are enabled".to_string(),
        ));
    }

    if cfg.min_active_span_ms < 0 {
        return Err(SnapshotError::InvalidConfig(
            "min_active_span_ms must be >= 0".to_string(),
        ));
    }

    Ok(())
}

fn user_spans<'a>(events: &'a [AttributedEvent], churn_page: &str) -> BTreeMap<&'a str, UserSpan> {
    let mut spans: BTreeMap<&str, UserSpan> = BTreeMap::new();
    for event in events {
        let ts = event.ts_ms_utc();
        let is_churn = event.event.page == churn_page;
        spans
            .entry(event.user_id())
            .and_modify(|span| {
                span.first_ts_ms_utc = span.first_ts_ms_utc.min(ts);
                span.last_ts_ms_utc = span.last_ts_ms_utc.max(ts);
                if is_churn {
                    span.churn_ts_ms_utc = Some(span.churn_ts_ms_utc.map_or(ts, |c| c.min(ts)));
                }
            })
            .or_insert(UserSpan {
                first_ts_ms_utc: ts,
                last_ts_ms_utc: ts,
                churn_ts_ms_utc: is_churn.then_some(ts),
            });
    }
    spans
}

fn churned_snapshots(
    user_id: &str,
    span: &UserSpan,
    churn_ts: i64,
    cfg: &SnapshotConfig,
    out: &mut Vec<Snapshot>,
) {
    let offsets = cfg
        .positive_offsets_days
        .iter()
        .map(|days| (*days, 1_u8, SnapshotKind::PreChurn))
        .chain(
            cfg.negative_offsets_days
                .iter()
                .map(|days| (*days, 0_u8, SnapshotKind::EarlyNegative)),
        );

    for (days, label, kind) in offsets {
        let cutoff = days_ms(days).and_then(|offset| churn_ts.checked_sub(offset));
        match cutoff {
            Some(cutoff) if cutoff > span.first_ts_ms_utc => {
                out.push(Snapshot::labeled(user_id, cutoff, label, kind));
            }
            _ => debug!(
                component = "snapshots",
                event = "snapshots.generate.before_first_event",
                user_id,
                offset_days = days,
                cutoff_ts_ms_utc = ?cutoff
            ),
        }
    }
}

fn active_snapshots(
    user_id: &str,
    span: &UserSpan,
    cfg: &SnapshotConfig,
    rng: &mut StdRng,
    out: &mut Vec<Snapshot>,
) {
    if span.last_ts_ms_utc - span.first_ts_ms_utc < cfg.min_active_span_ms {
        out.push(Snapshot::labeled(
            user_id,
            span.last_ts_ms_utc,
            0,
            SnapshotKind::ActiveSpan,
        ));
    } else {
        for _ in 0..cfg.random_snapshots {
            let cutoff = rng.gen_range(span.first_ts_ms_utc..=span.last_ts_ms_utc);
            out.push(Snapshot::labeled(user_id, cutoff, 0, SnapshotKind::Random));
        }
    }

    for _ in 0..cfg.dormancy_snapshots {
        let days = rng.gen_range(1..=cfg.dormancy_max_days);
        match days_ms(days).and_then(|offset| span.last_ts_ms_utc.checked_add(offset)) {
            Some(cutoff) => {
                out.push(Snapshot::labeled(user_id, cutoff, 0, SnapshotKind::Dormancy));
            }
            None => debug!(
                component = "snapshots",
                event = "snapshots.generate.dormancy_out_of_range",
                user_id,
                offset_days = days,
                last_ts_ms_utc = span.last_ts_ms_utc
            ),
        }
    }
}

fn days_ms(days: u32) -> Option<i64> {
    i64::from(days).checked_mul(DAY_MS)
}
