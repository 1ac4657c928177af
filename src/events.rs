//! Raw event log normalization.
//!
//! Turns a loosely typed [`RawEventTable`] into canonical [`Event`] records:
//! - `userId` becomes a trimmed string (`"123.0"` collapses to `"123"`)
//! - `ts` and `registration` become UTC epoch milliseconds
//! - columns outside the event schema are stripped
//! - output is ordered by `(user_id, ts_ms_utc)`

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DAY_MS: i64 = 86_400_000;

pub const REQUIRED_COLUMNS: [&str; 3] = ["userId", "ts", "page"];

pub const OPTIONAL_COLUMNS: [&str; 10] = [
    "status",
    "sessionId",
    "song",
    "artist",
    "length",
    "level",
    "gender",
    "registration",
    "userAgent",
    "location",
];

const SECONDARY_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Untyped event table as handed over by a storage collaborator. Empty cells
/// are nulls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEventTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawEventTable {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header.trim() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub user_id: String,
    pub ts_ms_utc: i64,
    pub page: String,
    pub status: Option<u16>,
    pub session_id: Option<i64>,
    pub song: Option<String>,
    pub artist: Option<String>,
    pub length: Option<f64>,
    pub level: Option<String>,
    pub gender: Option<String>,
    pub registration_ts_ms_utc: Option<i64>,
    pub user_agent: Option<String>,
    pub location: Option<String>,
}

impl Event {
    /// Event with only the required fields set.
    pub fn new(user_id: impl Into<String>, ts_ms_utc: i64, page: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ts_ms_utc,
            page: page.into(),
            status: None,
            session_id: None,
            song: None,
            artist: None,
            length: None,
            level: None,
            gender: None,
            registration_ts_ms_utc: None,
            user_agent: None,
            location: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeConfig {
    pub drop_anonymous: bool,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            drop_anonymous: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeReport {
    pub input_rows: u64,
    pub output_rows: u64,
    pub dropped_anonymous_rows: u64,
    pub secondary_parses: u64,
    pub stripped_columns: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("required column {column} is absent")]
    MissingColumn { column: &'static str },
    #[error("failed to parse field {field} at row {row}: '{value}'")]
    ParseField {
        row: usize,
        field: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, Copy)]
struct ColumnIndex {
    user_id: usize,
    ts: usize,
    page: usize,
    status: Option<usize>,
    session_id: Option<usize>,
    song: Option<usize>,
    artist: Option<usize>,
    length: Option<usize>,
    level: Option<usize>,
    gender: Option<usize>,
    registration: Option<usize>,
    user_agent: Option<usize>,
    location: Option<usize>,
}

impl ColumnIndex {
    fn resolve(table: &RawEventTable) -> Result<Self, NormalizeError> {
        let required = |column: &'static str| {
            table
                .column(column)
                .ok_or(NormalizeError::MissingColumn { column })
        };

        Ok(Self {
            user_id: required("userId")?,
            ts: required("ts")?,
            page: required("page")?,
            status: table.column("status"),
            session_id: table.column("sessionId"),
            song: table.column("song"),
            artist: table.column("artist"),
            length: table.column("length"),
            level: table.column("level"),
            gender: table.column("gender"),
            registration: table.column("registration"),
            user_agent: table.column("userAgent"),
            location: table.column("location"),
        })
    }
}

pub fn normalize_events(
    table: &RawEventTable,
    cfg: &NormalizeConfig,
) -> Result<(Vec<Event>, NormalizeReport), NormalizeError> {
    let columns = ColumnIndex::resolve(table)?;

    let stripped_columns = stripped_columns(&table.headers);
    if !stripped_columns.is_empty() {
        warn!(
            component = "events",
            event = "events.normalize.columns_stripped",
            columns = ?stripped_columns
        );
    }

    let mut report = NormalizeReport {
        input_rows: table.len() as u64,
        stripped_columns,
        ..NormalizeReport::default()
    };

    let mut events = Vec::with_capacity(table.len());
    for (row_idx, row) in table.rows.iter().enumerate() {
        let user_id = normalize_user_id(cell(row, Some(columns.user_id)).unwrap_or_default());
        if user_id.is_empty() && cfg.drop_anonymous {
            report.dropped_anonymous_rows += 1;
            continue;
        }

        let ts_ms_utc = required_timestamp(row, row_idx, columns.ts, "ts", &mut report)?;
        let page = cell(row, Some(columns.page))
            .ok_or_else(|| NormalizeError::ParseField {
                row: row_idx,
                field: "page",
                value: String::new(),
            })?
            .to_string();

        let registration_ts_ms_utc = match cell(row, columns.registration) {
            Some(raw) => Some(parse_timestamp(raw, row_idx, "registration", &mut report)?),
            None => None,
        };

        events.push(Event {
            user_id,
            ts_ms_utc,
            page,
            status: optional_integer(row, row_idx, columns.status, "status")?,
            session_id: optional_integer(row, row_idx, columns.session_id, "sessionId")?,
            song: cell(row, columns.song).map(str::to_string),
            artist: cell(row, columns.artist).map(str::to_string),
            length: optional_f64(row, row_idx, columns.length, "length")?,
            level: cell(row, columns.level).map(str::to_string),
            gender: cell(row, columns.gender).map(str::to_string),
            registration_ts_ms_utc,
            user_agent: cell(row, columns.user_agent).map(str::to_string),
            location: cell(row, columns.location).map(str::to_string),
        });
    }

    events.sort_by(|a, b| {
        a.user_id
            .cmp(&b.user_id)
            .then_with(|| a.ts_ms_utc.cmp(&b.ts_ms_utc))
    });
    report.output_rows = events.len() as u64;

    if report.dropped_anonymous_rows > 0 {
        warn!(
            component = "events",
            event = "events.normalize.anonymous_dropped",
            rows = report.dropped_anonymous_rows
        );
    }

    info!(
        component = "events",
        event = "events.normalize.finish",
        input_rows = report.input_rows,
        output_rows = report.output_rows,
        secondary_parses = report.secondary_parses
    );

    Ok((events, report))
}

/// Parses a timestamp cell into epoch milliseconds. The second element is
/// `true` when only a secondary format matched.
pub fn parse_timestamp_ms(raw: &str) -> Option<(i64, bool)> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return representable_ms(ms).map(|ms| (ms, false));
    }

    if let Ok(ms) = raw.parse::<f64>() {
        let ms = ms.round();
        // `as` saturates; anything outside i64 must not reach the cast.
        if !(ms.is_finite() && ms >= i64::MIN as f64 && ms < i64::MAX as f64) {
            return None;
        }
        return representable_ms(ms as i64).map(|ms| (ms, true));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some((dt.timestamp_millis(), true));
    }

    for format in SECONDARY_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some((naive.and_utc().timestamp_millis(), true));
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| (naive.and_utc().timestamp_millis(), true))
}

/// Epoch millis that map onto a calendar instant. Keeps day offsets added
/// downstream far from `i64` overflow.
fn representable_ms(ms: i64) -> Option<i64> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|_| ms)
}

fn stripped_columns(headers: &[String]) -> Vec<String> {
    let known: BTreeSet<&str> = REQUIRED_COLUMNS
        .iter()
        .chain(OPTIONAL_COLUMNS.iter())
        .copied()
        .collect();
    headers
        .iter()
        .map(|header| header.trim())
        .filter(|header| !known.contains(header))
        .map(str::to_string)
        .collect()
}

fn normalize_user_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(int_part) = trimmed.strip_suffix(".0") {
        if !int_part.is_empty() && int_part.bytes().all(|b| b.is_ascii_digit()) {
            return int_part.to_string();
        }
    }
    trimmed.to_string()
}

fn cell(row: &[String], idx: Option<usize>) -> Option<&str> {
    let value = row.get(idx?)?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn required_timestamp(
    row: &[String],
    row_idx: usize,
    idx: usize,
    field: &'static str,
    report: &mut NormalizeReport,
) -> Result<i64, NormalizeError> {
    let raw = cell(row, Some(idx)).unwrap_or_default();
    parse_timestamp(raw, row_idx, field, report)
}

fn parse_timestamp(
    raw: &str,
    row_idx: usize,
    field: &'static str,
    report: &mut NormalizeReport,
) -> Result<i64, NormalizeError> {
    match parse_timestamp_ms(raw) {
        Some((ms, secondary)) => {
            if secondary {
                report.secondary_parses += 1;
                debug!(
                    component = "events",
                    event = "events.normalize.secondary_parse",
                    row = row_idx,
                    field,
                    value = raw
                );
            }
            Ok(ms)
        }
        None => Err(NormalizeError::ParseField {
            row: row_idx,
            field,
            value: raw.to_string(),
        }),
    }
}

fn optional_integer<T>(
    row: &[String],
    row_idx: usize,
    idx: Option<usize>,
    field: &'static str,
) -> Result<Option<T>, NormalizeError>
where
    T: std::str::FromStr + TryFrom<i64>,
{
    let Some(raw) = cell(row, idx) else {
        return Ok(None);
    };
    if let Ok(value) = raw.parse::<T>() {
        return Ok(Some(value));
    }

    // Integer columns frequently arrive float-typed ("404.0").
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && value.fract() == 0.0)
        .and_then(|value| T::try_from(value as i64).ok())
        .map(Some)
        .ok_or_else(|| NormalizeError::ParseField {
            row: row_idx,
            field,
            value: raw.to_string(),
        })
}

fn optional_f64(
    row: &[String],
    row_idx: usize,
    idx: Option<usize>,
    field: &'static str,
) -> Result<Option<f64>, NormalizeError> {
    let Some(raw) = cell(row, idx) else {
        return Ok(None);
    };
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(Some)
        .ok_or_else(|| NormalizeError::ParseField {
            row: row_idx,
            field,
            value: raw.to_string(),
        })
}
