//! Target labels for aggregated feature rows.

use std::collections::{BTreeSet, HashMap};

use tracing::info;

use crate::attributes::AttributedEvent;
use crate::events::{Event, DAY_MS};
use crate::features::FeatureTable;
use crate::snapshots::Snapshot;

pub const DEFAULT_CHURN_WINDOW_DAYS: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub enum LabelSource<'a> {
    /// Labels carried by the snapshots the rows were aggregated from.
    Snapshots(&'a [Snapshot]),
    /// Whether the user ever reached `churn_page` anywhere in the log.
    /// Only meaningful for one row per user anchored at the end of history.
    EverCancelled {
        events: &'a [AttributedEvent],
        churn_page: &'a str,
    },
}

pub fn join_labels(mut table: FeatureTable, source: LabelSource<'_>) -> FeatureTable {
    let mode = match source {
        LabelSource::Snapshots(snapshots) => {
            let mut labels: HashMap<(&str, i64), Option<u8>> = HashMap::new();
            for snapshot in snapshots {
                labels.entry(snapshot.key()).or_insert(snapshot.label);
            }
            for row in &mut table.rows {
                row.target = labels
                    .get(&(row.user_id.as_str(), row.cutoff_ts_ms_utc))
                    .copied()
                    .flatten();
            }
            "snapshot"
        }
        LabelSource::EverCancelled { events, churn_page } => {
            let cancelled = ever_cancelled_users(events, churn_page);
            for row in &mut table.rows {
                row.target = Some(u8::from(cancelled.contains(&row.user_id)));
            }
            "ever_cancelled"
        }
    };

    let positives = table
        .rows
        .iter()
        .filter(|row| row.target == Some(1))
        .count();
    let unlabeled = table.rows.iter().filter(|row| row.target.is_none()).count();

    info!(
        component = "labels",
        event = "labels.join.finish",
        mode,
        rows = table.rows.len(),
        positives,
        unlabeled
    );

    table
}

pub fn ever_cancelled_users(events: &[AttributedEvent], churn_page: &str) -> BTreeSet<String> {
    events
        .iter()
        .filter(|event| event.event.page == churn_page)
        .map(|event| event.user_id().to_string())
        .collect()
}

/// Per-event label, in input order: 1 when the event falls within
/// `window_days` before (inclusive) the user's first cancellation.
pub fn label_churn_window(events: &[Event], window_days: u32, churn_page: &str) -> Vec<u8> {
    let mut churn_ts: HashMap<&str, i64> = HashMap::new();
    for event in events.iter().filter(|event| event.page == churn_page) {
        churn_ts
            .entry(event.user_id.as_str())
            .and_modify(|ts| *ts = (*ts).min(event.ts_ms_utc))
            .or_insert(event.ts_ms_utc);
    }

    let window_ms = i64::from(window_days) * DAY_MS;
    events
        .iter()
        .map(|event| match churn_ts.get(event.user_id.as_str()) {
            Some(churn) => {
                u8::from(event.ts_ms_utc >= churn.saturating_sub(window_ms) && event.ts_ms_utc <= *churn)
            }
            None => 0,
        })
        .collect()
}
