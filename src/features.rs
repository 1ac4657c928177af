//! Snapshot-based windowed feature aggregation.
//!
//! Every row is computed from the events a user had produced at or before
//! the snapshot cutoff. Rolling windows and recency are anchored at the
//! cutoff, never at the user's last observed event.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::attributes::{AttributedEvent, Platform, UNKNOWN_REGION};
use crate::events::DAY_MS;
use crate::labels::{join_labels, LabelSource};
use crate::snapshots::{Snapshot, CHURN_PAGE};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

const SONG_PAGE: &str = "NextSong";
const THUMBS_UP_PAGE: &str = "Thumbs Up";
const THUMBS_DOWN_PAGE: &str = "Thumbs Down";
const ADVERT_PAGE: &str = "Roll Advert";
const ERROR_PAGE: &str = "Error";
const DOWNGRADE_PAGE: &str = "Submit Downgrade";
const MINUTE_MS: f64 = 60_000.0;

const TOTAL_COLUMNS: [&str; 8] = [
    "total_songs",
    "total_thumbs_up",
    "total_thumbs_down",
    "total_ads",
    "total_errors",
    "total_listen_time",
    "ever_downgraded",
    "total_sessions",
];

const WINDOW_METRICS: [&str; 5] = [
    "songs",
    "errors",
    "listen_time",
    "unique_artists",
    "unique_songs",
];

const DERIVED_COLUMNS: [&str; 9] = [
    "avg_songs_per_day",
    "thumbs_ratio",
    "errors_per_song",
    "songs_trend",
    "listen_time_trend",
    "avg_days_between_sessions",
    "avg_songs_per_session",
    "avg_session_duration",
    "days_since_last_session",
];

pub const STATE_FREQ_COLUMN: &str = "state_freq";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub user_id: String,
    pub cutoff_ts_ms_utc: i64,
    pub values: Vec<f64>,
    pub target: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
    /// Share of rows per region in this batch; source of `state_freq`.
    pub region_frequencies: BTreeMap<String, f64>,
}

impl FeatureTable {
    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        let idx = self.schema.column_index(column)?;
        self.rows.get(row)?.values.get(idx).copied()
    }

    /// Feature values without identifier or label columns.
    pub fn feature_matrix(&self) -> Vec<Vec<f64>> {
        self.rows.iter().map(|row| row.values.clone()).collect()
    }

    pub fn targets(&self) -> Vec<Option<u8>> {
        self.rows.iter().map(|row| row.target).collect()
    }

    /// Re-lays the table out in `target`'s column order. Columns the table
    /// lacks are filled with 0, columns `target` lacks are dropped.
    pub fn align_to(&self, target: &FeatureSchema) -> FeatureTable {
        let mapping: Vec<Option<usize>> = target
            .columns
            .iter()
            .map(|column| self.schema.column_index(&column.name))
            .collect();

        let missing = mapping.iter().filter(|idx| idx.is_none()).count();
        if missing > 0 {
            info!(
                component = "features",
                event = "features.align.zero_filled",
                missing_columns = missing,
                target_fingerprint = %target.fingerprint
            );
        }

        let rows = self
            .rows
            .iter()
            .map(|row| FeatureRow {
                user_id: row.user_id.clone(),
                cutoff_ts_ms_utc: row.cutoff_ts_ms_utc,
                values: mapping
                    .iter()
                    .map(|idx| idx.and_then(|i| row.values.get(i).copied()).unwrap_or(0.0))
                    .collect(),
                target: row.target,
            })
            .collect();

        FeatureTable {
            schema: target.clone(),
            rows,
            region_frequencies: self.region_frequencies.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureAggregationConfig {
    pub windows_days: Vec<u32>,
    pub trend_short_days: u32,
    pub trend_long_days: u32,
    /// Scales the long-window sum down to the short window's length.
    pub trend_rate_divisor: f64,
    pub trend_floor: f64,
    pub errors_per_song_cap: f64,
    pub churn_page: String,
    pub schema_version: u32,
}

impl Default for FeatureAggregationConfig {
    fn default() -> Self {
        Self {
            windows_days: vec![1, 3, 7, 14, 30],
            trend_short_days: 7,
            trend_long_days: 30,
            trend_rate_divisor: 4.0,
            trend_floor: 0.1,
            errors_per_song_cap: 5.0,
            churn_page: CHURN_PAGE.to_string(),
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("invalid feature aggregation config: {0}")]
    InvalidConfig(String),
    #[error("snapshot references user {user_id} (cutoff {cutoff_ts_ms_utc}) absent from the event log")]
    MissingUser {
        user_id: String,
        cutoff_ts_ms_utc: i64,
    },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
    #[error("snapshots for user {user_id} at cutoff {cutoff_ts_ms_utc} carry conflicting labels")]
    ConflictingLabels {
        user_id: String,
        cutoff_ts_ms_utc: i64,
    },
    #[error("classifier returned {actual} probabilities for {expected} rows")]
    ClassifierOutput { expected: usize, actual: usize },
}

/// Downstream model consuming the feature matrix.
pub trait ProbabilisticClassifier {
    fn predict_proba(&self, columns: &[FeatureColumn], rows: &[Vec<f64>]) -> Vec<f64>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChurnScore {
    pub user_id: String,
    pub cutoff_ts_ms_utc: i64,
    pub probability: f64,
}

#[derive(Debug, Clone, Default)]
struct WindowAggregate {
    songs: f64,
    errors: f64,
    listen_time: f64,
    unique_artists: f64,
    unique_songs: f64,
}

impl WindowAggregate {
    fn metric(&self, name: &str) -> f64 {
        match name {
            "songs" => self.songs,
            "errors" => self.errors,
            "listen_time" => self.listen_time,
            "unique_artists" => self.unique_artists,
            "unique_songs" => self.unique_songs,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct SubsetAggregate {
    gender: Option<String>,
    last_level: Option<String>,
    registration_ts_ms_utc: Option<i64>,
    platform: Platform,
    region: String,
    first_ts_ms_utc: Option<i64>,
    last_ts_ms_utc: Option<i64>,
    songs: f64,
    thumbs_up: f64,
    thumbs_down: f64,
    ads: f64,
    errors: f64,
    listen_time: f64,
    ever_downgraded: f64,
    sessions: f64,
    session_minutes: f64,
}

pub fn build_feature_schema(cfg: &FeatureAggregationConfig) -> FeatureSchema {
    let mut names: Vec<String> = vec!["gender_male".to_string(), "level_paid".to_string()];
    for platform in Platform::ALL {
        names.push(format!("platform_{}", platform.as_str()));
    }
    names.push(STATE_FREQ_COLUMN.to_string());
    names.extend(TOTAL_COLUMNS.iter().map(|name| name.to_string()));
    names.push("account_lifetime_days".to_string());
    for metric in WINDOW_METRICS {
        for window in &cfg.windows_days {
            names.push(format!("{metric}_last_{window}d"));
        }
    }
    names.extend(DERIVED_COLUMNS.iter().map(|name| name.to_string()));

    let columns: Vec<FeatureColumn> = names
        .into_iter()
        .map(|name| FeatureColumn {
            name,
            dtype: FeatureDType::F64,
        })
        .collect();

    let fingerprint = schema_fingerprint(cfg, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        windows_days = ?cfg.windows_days,
        column_count = columns.len(),
        fingerprint = %fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

/// Aggregates one row per snapshot, or one row per user anchored at that
/// user's own last event when `snapshots` is `None`.
pub fn aggregate_features(
    events: &[AttributedEvent],
    snapshots: Option<&[Snapshot]>,
    cfg: &FeatureAggregationConfig,
) -> Result<FeatureTable, FeatureError> {
    validate_config(cfg)?;

    info!(
        component = "features",
        event = "features.aggregate.start",
        events = events.len(),
        snapshots = ?snapshots.map(<[Snapshot]>::len),
        mode = if snapshots.is_some() { "snapshot" } else { "per_user" }
    );

    let schema = build_feature_schema(cfg);
    let by_user = events_by_user(events);

    let cutoffs: Vec<(&str, i64)> = match snapshots {
        Some(snapshots) => unique_snapshot_keys(snapshots)?,
        None => by_user
            .iter()
            .filter_map(|(user_id, events)| {
                events.last().map(|event| (*user_id, event.ts_ms_utc()))
            })
            .collect(),
    };

    let mut rows = Vec::with_capacity(cutoffs.len());
    let mut regions = Vec::with_capacity(cutoffs.len());
    let mut empty_subsets = 0_u64;

    for (user_id, cutoff) in cutoffs {
        let user_events = by_user
            .get(user_id)
            .ok_or_else(|| FeatureError::MissingUser {
                user_id: user_id.to_string(),
                cutoff_ts_ms_utc: cutoff,
            })?;

        let visible = visible_events(user_events, cutoff);
        if visible.is_empty() {
            empty_subsets += 1;
            debug!(
                component = "features",
                event = "features.aggregate.empty_subset",
                user_id,
                cutoff_ts_ms_utc = cutoff
            );
        }

        let subset = aggregate_subset(visible);
        let windows: Vec<WindowAggregate> = cfg
            .windows_days
            .iter()
            .map(|days| aggregate_window(visible, cutoff, *days))
            .collect();

        regions.push(subset.region.clone());
        rows.push(FeatureRow {
            user_id: user_id.to_string(),
            cutoff_ts_ms_utc: cutoff,
            values: row_values(&subset, &windows, cutoff, cfg),
            target: None,
        });
    }

    let region_frequencies = region_frequencies(&regions);
    if let Some(state_idx) = schema.column_index(STATE_FREQ_COLUMN) {
        for (row, region) in rows.iter_mut().zip(&regions) {
            row.values[state_idx] = region_frequencies.get(region).copied().unwrap_or(0.0);
        }
    }

    let table = FeatureTable {
        schema,
        rows,
        region_frequencies,
    };

    let source = match snapshots {
        Some(snapshots) => LabelSource::Snapshots(snapshots),
        None => LabelSource::EverCancelled {
            events,
            churn_page: &cfg.churn_page,
        },
    };
    let table = join_labels(table, source);

    info!(
        component = "features",
        event = "features.aggregate.finish",
        rows = table.rows.len(),
        users = by_user.len(),
        empty_subsets,
        regions = table.region_frequencies.len()
    );

    Ok(table)
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Scores `table` after aligning it to the schema the classifier was
/// trained on.
pub fn score_feature_table(
    classifier: &dyn ProbabilisticClassifier,
    table: &FeatureTable,
    train_schema: &FeatureSchema,
) -> Result<Vec<ChurnScore>, FeatureError> {
    let aligned = table.align_to(train_schema);
    let matrix = aligned.feature_matrix();
    let probabilities = classifier.predict_proba(&train_schema.columns, &matrix);

    if probabilities.len() != matrix.len() {
        return Err(FeatureError::ClassifierOutput {
            expected: matrix.len(),
            actual: probabilities.len(),
        });
    }

    Ok(aligned
        .rows
        .into_iter()
        .zip(probabilities)
        .map(|(row, probability)| ChurnScore {
            user_id: row.user_id,
            cutoff_ts_ms_utc: row.cutoff_ts_ms_utc,
            probability,
        })
        .collect())
}

fn validate_config(cfg: &FeatureAggregationConfig) -> Result<(), FeatureError> {
    if cfg.windows_days.is_empty() {
        return Err(FeatureError::InvalidConfig(
            "windows_days must not be empty".to_string(),
        ));
    }

    if cfg.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(FeatureError::InvalidConfig(format!(
            "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
        )));
    }

    let mut seen = HashSet::new();
    for window in &cfg.windows_days {
        if *window == 0 {
            return Err(FeatureError::InvalidConfig(
                "windows_days entries must be > 0".to_string(),
            ));
        }
        if !seen.insert(*window) {
            return Err(FeatureError::InvalidConfig(
                "windows_days entries must be unique".to_string(),
            ));
        }
    }

    if !seen.contains(&cfg.trend_short_days) || !seen.contains(&cfg.trend_long_days) {
        return Err(FeatureError::InvalidConfig(format!(
            "trend windows {}d and {}d must both be in windows_days",
            cfg.trend_short_days, cfg.trend_long_days
        )));
    }

    if !(cfg.trend_floor > 0.0) || !(cfg.trend_rate_divisor > 0.0) {
        return Err(FeatureError::InvalidConfig(
            "trend_floor and trend_rate_divisor must be > 0".to_string(),
        ));
    }

    if !(cfg.errors_per_song_cap >= 0.0) {
        return Err(FeatureError::InvalidConfig(
            "errors_per_song_cap must be >= 0".to_string(),
        ));
    }

    Ok(())
}

/// Snapshot keys in input order, one per `(user_id, cutoff)`. Repeats with
/// the same label collapse; repeats with different labels are rejected.
fn unique_snapshot_keys(snapshots: &[Snapshot]) -> Result<Vec<(&str, i64)>, FeatureError> {
    let mut labels: HashMap<(&str, i64), Option<u8>> = HashMap::with_capacity(snapshots.len());
    let mut keys = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        let key = snapshot.key();
        match labels.get(&key).copied() {
            None => {
                labels.insert(key, snapshot.label);
                keys.push(key);
            }
            Some(label) if label == snapshot.label => {}
            Some(_) => {
                return Err(FeatureError::ConflictingLabels {
                    user_id: snapshot.user_id.clone(),
                    cutoff_ts_ms_utc: snapshot.cutoff_ts_ms_utc,
                })
            }
        }
    }

    let duplicates = snapshots.len() - keys.len();
    if duplicates > 0 {
        warn!(
            component = "features",
            event = "features.aggregate.duplicate_snapshots",
            duplicates
        );
    }

    Ok(keys)
}

fn events_by_user(events: &[AttributedEvent]) -> BTreeMap<&str, Vec<&AttributedEvent>> {
    let mut by_user: BTreeMap<&str, Vec<&AttributedEvent>> = BTreeMap::new();
    for event in events {
        by_user.entry(event.user_id()).or_default().push(event);
    }
    for user_events in by_user.values_mut() {
        user_events.sort_by_key(|event| event.ts_ms_utc());
    }
    by_user
}

/// Prefix of a time-sorted event list with `ts <= cutoff`.
fn visible_events<'a>(
    user_events: &'a [&'a AttributedEvent],
    cutoff: i64,
) -> &'a [&'a AttributedEvent] {
    let end = user_events.partition_point(|event| event.ts_ms_utc() <= cutoff);
    &user_events[..end]
}

fn aggregate_subset(visible: &[&AttributedEvent]) -> SubsetAggregate {
    let mut agg = SubsetAggregate {
        gender: None,
        last_level: None,
        registration_ts_ms_utc: None,
        platform: Platform::Unknown,
        region: UNKNOWN_REGION.to_string(),
        first_ts_ms_utc: visible.first().map(|event| event.ts_ms_utc()),
        last_ts_ms_utc: visible.last().map(|event| event.ts_ms_utc()),
        songs: 0.0,
        thumbs_up: 0.0,
        thumbs_down: 0.0,
        ads: 0.0,
        errors: 0.0,
        listen_time: 0.0,
        ever_downgraded: 0.0,
        sessions: 0.0,
        session_minutes: 0.0,
    };

    let mut platform_seen = false;
    let mut region_seen = false;
    let mut session_spans: BTreeMap<i64, (i64, i64)> = BTreeMap::new();

    for attributed in visible {
        let event = &attributed.event;
        if agg.gender.is_none() {
            agg.gender = event.gender.clone();
        }
        if event.level.is_some() {
            agg.last_level = event.level.clone();
        }
        if agg.registration_ts_ms_utc.is_none() {
            agg.registration_ts_ms_utc = event.registration_ts_ms_utc;
        }
        if !platform_seen && attributed.platform != Platform::Unknown {
            agg.platform = attributed.platform;
            platform_seen = true;
        }
        if !region_seen && attributed.region != UNKNOWN_REGION {
            agg.region = attributed.region.clone();
            region_seen = true;
        }

        if is_song(attributed) {
            agg.songs += 1.0;
            agg.listen_time += event.length.unwrap_or(0.0);
        }
        match event.page.as_str() {
            THUMBS_UP_PAGE => agg.thumbs_up += 1.0,
            THUMBS_DOWN_PAGE => agg.thumbs_down += 1.0,
            ADVERT_PAGE => agg.ads += 1.0,
            DOWNGRADE_PAGE => agg.ever_downgraded = 1.0,
            _ => {}
        }
        if is_error(attributed) {
            agg.errors += 1.0;
        }

        if let Some(session_id) = event.session_id {
            let ts = event.ts_ms_utc;
            session_spans
                .entry(session_id)
                .and_modify(|(start, end)| {
                    *start = (*start).min(ts);
                    *end = (*end).max(ts);
                })
                .or_insert((ts, ts));
        }
    }

    agg.sessions = session_spans.len() as f64;
    agg.session_minutes = session_spans
        .values()
        .map(|(start, end)| end.saturating_sub(*start) as f64 / MINUTE_MS)
        .sum();
    agg
}

fn aggregate_window(visible: &[&AttributedEvent], cutoff: i64, days: u32) -> WindowAggregate {
    let span_ms = i64::from(days) * DAY_MS;
    let start =
        visible.partition_point(|event| cutoff.saturating_sub(event.ts_ms_utc()) > span_ms);

    let mut window = WindowAggregate::default();
    let mut artists = HashSet::new();
    let mut songs = HashSet::new();
    for attributed in &visible[start..] {
        let event = &attributed.event;
        if is_song(attributed) {
            window.songs += 1.0;
            window.listen_time += event.length.unwrap_or(0.0);
        }
        if is_error(attributed) {
            window.errors += 1.0;
        }
        if let Some(artist) = event.artist.as_deref() {
            artists.insert(artist);
        }
        if let Some(song) = event.song.as_deref() {
            songs.insert(song);
        }
    }
    window.unique_artists = artists.len() as f64;
    window.unique_songs = songs.len() as f64;
    window
}

fn row_values(
    subset: &SubsetAggregate,
    windows: &[WindowAggregate],
    cutoff: i64,
    cfg: &FeatureAggregationConfig,
) -> Vec<f64> {
    let mut values = Vec::new();

    values.push(indicator(subset.gender.as_deref() == Some("M")));
    values.push(indicator(subset.last_level.as_deref() == Some("paid")));
    for platform in Platform::ALL {
        values.push(indicator(subset.platform == platform));
    }
    // Filled in once the whole batch is known.
    values.push(0.0);

    values.push(subset.songs);
    values.push(subset.thumbs_up);
    values.push(subset.thumbs_down);
    values.push(subset.ads);
    values.push(subset.errors);
    values.push(subset.listen_time);
    values.push(subset.ever_downgraded);
    values.push(subset.sessions);

    let lifetime_days = subset
        .registration_ts_ms_utc
        .or(subset.first_ts_ms_utc)
        .map(|start| days_between(start, cutoff).max(0.0))
        .unwrap_or(0.0);
    values.push(lifetime_days);

    for metric in WINDOW_METRICS {
        for window in windows {
            values.push(window.metric(metric));
        }
    }

    let window_for = |days: u32| {
        cfg.windows_days
            .iter()
            .position(|w| *w == days)
            .and_then(|idx| windows.get(idx))
    };
    let (short, long) = match (
        window_for(cfg.trend_short_days),
        window_for(cfg.trend_long_days),
    ) {
        (Some(short), Some(long)) => (short.clone(), long.clone()),
        _ => (WindowAggregate::default(), WindowAggregate::default()),
    };

    let sessions = subset.sessions.max(1.0);
    values.push(subset.songs / (lifetime_days + 1.0));
    values.push(subset.thumbs_up / (subset.thumbs_up + subset.thumbs_down + 1.0));
    values.push((subset.errors / (subset.songs + 1.0)).min(cfg.errors_per_song_cap));
    values.push(trend(short.songs, long.songs, cfg));
    values.push(trend(short.listen_time, long.listen_time, cfg));
    values.push(lifetime_days / sessions);
    values.push(subset.songs / sessions);
    values.push(subset.session_minutes / sessions);
    values.push(
        subset
            .last_ts_ms_utc
            .map(|last| days_between(last, cutoff))
            .unwrap_or(lifetime_days),
    );

    values
}

fn trend(short_sum: f64, long_sum: f64, cfg: &FeatureAggregationConfig) -> f64 {
    short_sum / (long_sum / cfg.trend_rate_divisor + cfg.trend_floor)
}

fn region_frequencies(regions: &[String]) -> BTreeMap<String, f64> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for region in regions {
        *counts.entry(region.clone()).or_default() += 1;
    }
    let total = regions.len() as f64;
    counts
        .into_iter()
        .map(|(region, count)| (region, count as f64 / total))
        .collect()
}

fn is_song(event: &AttributedEvent) -> bool {
    event.event.page == SONG_PAGE
}

fn is_error(event: &AttributedEvent) -> bool {
    event.event.page == ERROR_PAGE || event.event.status.is_some_and(|status| status >= 400)
}

fn indicator(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

fn days_between(start_ms: i64, end_ms: i64) -> f64 {
    end_ms.saturating_sub(start_ms) as f64 / DAY_MS as f64
}

fn schema_fingerprint(cfg: &FeatureAggregationConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update("windows_days:");
    for window in &cfg.windows_days {
        hasher.update(format!("{window},"));
    }
    hasher.update(format!(
        ";trend:{}/{};",
        cfg.trend_short_days, cfg.trend_long_days
    ));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}
