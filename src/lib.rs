//! Point-in-time churn features from a user event log.
//!
//! Stages, leaf first:
//! - event normalization and per-event attributes
//! - training snapshot generation (user, cutoff, label)
//! - windowed feature aggregation anchored at each snapshot cutoff
//! - label joining, schema alignment and CSV/JSON table codecs

mod attributes;
mod config;
mod diagnostics;
mod events;
mod features;
mod labels;
mod observability;
mod pipeline;
mod sampling;
mod snapshots;
mod table;

pub use attributes::{
    account_age_days, attribute_event, extract_attributes, platform_from_user_agent,
    region_from_location, AttributedEvent, Platform, UNKNOWN_REGION,
};
pub use config::{
    pipeline_config_from_env, ConfigError, PipelineConfig, ENV_DOWNSAMPLE_FRACTION,
    ENV_DOWNSAMPLE_MIN_EVENTS, ENV_SNAPSHOT_SEED, ENV_TRAIN_END,
};
pub use diagnostics::{cancellation_gap_stats, GapStats};
pub use events::{
    normalize_events, parse_timestamp_ms, Event, NormalizeConfig, NormalizeError,
    NormalizeReport, RawEventTable, DAY_MS, OPTIONAL_COLUMNS, REQUIRED_COLUMNS,
};
pub use features::{
    aggregate_features, assert_schema_compatible, build_feature_schema, score_feature_table,
    ChurnScore, FeatureAggregationConfig, FeatureColumn, FeatureDType, FeatureError, FeatureRow,
    FeatureSchema, FeatureTable, ProbabilisticClassifier, FEATURE_SCHEMA_VERSION,
    STATE_FREQ_COLUMN,
};
pub use labels::{
    ever_cancelled_users, join_labels, label_churn_window, LabelSource,
    DEFAULT_CHURN_WINDOW_DAYS,
};
pub use observability::{
    init_logging, log_run_start, logging_config_from_env, LogFormat, LoggingConfig,
    LoggingInitError, ENV_LOG_FORMAT, ENV_LOG_LEVEL, ENV_LOG_TARGET,
};
pub use pipeline::{
    build_inference_table, build_legacy_table, build_training_table, InferenceRun,
    PipelineError, TrainingRun,
};
pub use sampling::{downsample_users, DownsampleConfig, DownsampleReport, SamplingError};
pub use snapshots::{
    generate_snapshots, global_cutoff_snapshots, summarize_snapshots, Snapshot, SnapshotConfig,
    SnapshotError, SnapshotKind, SnapshotSummary, CHURN_PAGE, DEFAULT_SEED,
};
pub use table::{
    read_feature_table_csv, read_raw_events_csv, schema_from_json, schema_to_json,
    write_feature_table_csv, TableError,
};
