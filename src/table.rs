//! CSV codec for raw event tables and feature tables, JSON codec for
//! feature schemas. Works on readers and writers only.

use std::io::{Read, Write};

use csv::StringRecord;
use thiserror::Error;
use tracing::info;

use crate::events::RawEventTable;
use crate::features::{FeatureRow, FeatureSchema, FeatureTable};

const USER_ID_HEADER: &str = "user_id";
const CUTOFF_HEADER: &str = "cutoff_ts_ms_utc";
const TARGET_HEADER: &str = "target";

#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feature table header does not match schema: expected {expected:?}, got {actual:?}")]
    HeaderMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("failed to parse column {column} at row {row}: '{value}'")]
    ParseField {
        row: usize,
        column: String,
        value: String,
    },
}

pub fn read_raw_events_csv<R: Read>(reader: R) -> Result<RawEventTable, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(reader);

    let headers = reader
        .headers()?
        .iter()
        .map(|header| header.trim().to_string())
        .collect();
    let mut table = RawEventTable::new(headers);
    for record in reader.records() {
        let record = record?;
        table.push_row(record.iter().map(str::to_string).collect());
    }

    info!(
        component = "table",
        event = "table.raw_events.read",
        rows = table.len(),
        columns = table.headers.len()
    );

    Ok(table)
}

pub fn write_feature_table_csv<W: Write>(table: &FeatureTable, writer: W) -> Result<(), TableError> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(feature_table_header(&table.schema))?;

    for row in &table.rows {
        let mut record = Vec::with_capacity(row.values.len() + 3);
        record.push(row.user_id.clone());
        record.push(row.cutoff_ts_ms_utc.to_string());
        record.extend(row.values.iter().map(f64::to_string));
        record.push(row.target.map(|t| t.to_string()).unwrap_or_default());
        out.write_record(&record)?;
    }
    out.flush()?;

    info!(
        component = "table",
        event = "table.features.written",
        rows = table.rows.len(),
        fingerprint = %table.schema.fingerprint
    );

    Ok(())
}

/// Reads a table written by [`write_feature_table_csv`] under `schema`.
/// Region frequencies are not persisted and come back empty.
pub fn read_feature_table_csv<R: Read>(
    reader: R,
    schema: &FeatureSchema,
) -> Result<FeatureTable, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(reader);

    let expected = feature_table_header(schema);
    let actual: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if actual != expected {
        return Err(TableError::HeaderMismatch { expected, actual });
    }

    let mut rows = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        rows.push(parse_feature_record(&record?, row_idx, &expected)?);
    }

    Ok(FeatureTable {
        schema: schema.clone(),
        rows,
        region_frequencies: Default::default(),
    })
}

pub fn schema_to_json(schema: &FeatureSchema) -> Result<String, TableError> {
    Ok(serde_json::to_string_pretty(schema)?)
}

pub fn schema_from_json(raw: &str) -> Result<FeatureSchema, TableError> {
    Ok(serde_json::from_str(raw)?)
}

fn feature_table_header(schema: &FeatureSchema) -> Vec<String> {
    let mut header = Vec::with_capacity(schema.columns.len() + 3);
    header.push(USER_ID_HEADER.to_string());
    header.push(CUTOFF_HEADER.to_string());
    header.extend(schema.columns.iter().map(|column| column.name.clone()));
    header.push(TARGET_HEADER.to_string());
    header
}

fn parse_feature_record(
    record: &StringRecord,
    row_idx: usize,
    header: &[String],
) -> Result<FeatureRow, TableError> {
    let field = |idx: usize| record.get(idx).unwrap_or_default();
    let parse_error = |idx: usize| TableError::ParseField {
        row: row_idx,
        column: header.get(idx).cloned().unwrap_or_default(),
        value: field(idx).to_string(),
    };

    let value_count = header.len() - 3;
    let cutoff_ts_ms_utc = field(1).parse::<i64>().map_err(|_| parse_error(1))?;
    let values = (2..2 + value_count)
        .map(|idx| field(idx).parse::<f64>().map_err(|_| parse_error(idx)))
        .collect::<Result<Vec<_>, _>>()?;

    let target_idx = header.len() - 1;
    let target = match field(target_idx) {
        "" => None,
        raw => Some(raw.parse::<u8>().map_err(|_| parse_error(target_idx))?),
    };

    Ok(FeatureRow {
        user_id: field(0).to_string(),
        cutoff_ts_ms_utc,
        values,
        target,
    })
}
