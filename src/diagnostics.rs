//! Activity gap right before cancellation.
//!
//! A small median gap means users are active up to the moment they cancel,
//! so long inactivity by itself points at dormancy rather than churn.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::events::{Event, DAY_MS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapStats {
    pub count: u64,
    pub mean_days: f64,
    pub median_days: f64,
    pub max_days: f64,
}

/// Gap in days between every cancellation event and the same user's
/// preceding event. Cancellations without a preceding event are skipped.
pub fn cancellation_gap_stats(events: &[Event], churn_page: &str) -> Option<GapStats> {
    let mut by_user: HashMap<&str, Vec<&Event>> = HashMap::new();
    for event in events {
        by_user.entry(event.user_id.as_str()).or_default().push(event);
    }

    let mut gaps = Vec::new();
    for user_events in by_user.values_mut() {
        user_events.sort_by_key(|event| event.ts_ms_utc);
        for pair in user_events.windows(2) {
            if pair[1].page == churn_page {
                let gap_ms = pair[1].ts_ms_utc.saturating_sub(pair[0].ts_ms_utc);
                gaps.push(gap_ms as f64 / DAY_MS as f64);
            }
        }
    }

    if gaps.is_empty() {
        return None;
    }

    gaps.sort_by(f64::total_cmp);
    let count = gaps.len();
    let median_days = if count % 2 == 0 {
        (gaps[count / 2 - 1] + gaps[count / 2]) / 2.0
    } else {
        gaps[count / 2]
    };
    let stats = GapStats {
        count: count as u64,
        mean_days: gaps.iter().sum::<f64>() / count as f64,
        median_days,
        max_days: gaps[count - 1],
    };

    info!(
        component = "diagnostics",
        event = "diagnostics.cancellation_gap.finish",
        count = stats.count,
        mean_days = stats.mean_days,
        median_days = stats.median_days,
        max_days = stats.max_days
    );

    Some(stats)
}
