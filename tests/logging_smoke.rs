use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use churn_features::{
    aggregate_features, attribute_event, build_training_table, log_run_start, normalize_events,
    Event, FeatureAggregationConfig, LoggingConfig, NormalizeConfig, PipelineConfig,
    RawEventTable, Snapshot, SnapshotKind, DAY_MS,
};
use serde_json::Value;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .expect("writer lock should not be poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> Vec<Value> {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer
        .output_string()
        .lines()
        .map(|line| serde_json::from_str(line).expect("each log line is JSON"))
        .collect()
}

fn find_event<'a>(logs: &'a [Value], name: &str) -> Option<&'a Value> {
    logs.iter()
        .find(|line| line["fields"]["event"].as_str() == Some(name))
}

#[test]
fn aggregation_logs_start_label_join_and_finish() {
    let events = vec![
        attribute_event(Event::new("1", 10 * DAY_MS, "NextSong")),
        attribute_event(Event::new("1", 12 * DAY_MS, "NextSong")),
    ];
    let snapshots = vec![Snapshot::labeled("1", 11 * DAY_MS, 0, SnapshotKind::Random)];

    let logs = capture_logs(Level::INFO, || {
        aggregate_features(&events, Some(&snapshots), &FeatureAggregationConfig::default())
            .expect("aggregation succeeds");
    });

    let start = find_event(&logs, "features.aggregate.start").expect("start event");
    assert_eq!(start["fields"]["component"], "features");
    assert_eq!(start["fields"]["mode"], "snapshot");

    let finish = find_event(&logs, "features.aggregate.finish").expect("finish event");
    assert_eq!(finish["fields"]["rows"], 1);
    assert_eq!(finish["fields"]["empty_subsets"], 0);

    let join = find_event(&logs, "labels.join.finish").expect("label join event");
    assert_eq!(join["fields"]["mode"], "snapshot");
}

#[test]
fn empty_subsets_are_reported_at_debug_only() {
    let events = vec![attribute_event(Event::new("1", 10 * DAY_MS, "NextSong"))];
    let snapshots = vec![Snapshot::labeled("1", 5 * DAY_MS, 0, SnapshotKind::Random)];
    let run = || {
        aggregate_features(&events, Some(&snapshots), &FeatureAggregationConfig::default())
            .expect("aggregation succeeds");
    };

    let info_logs = capture_logs(Level::INFO, run);
    assert!(find_event(&info_logs, "features.aggregate.empty_subset").is_none());

    let debug_logs = capture_logs(Level::DEBUG, run);
    assert!(find_event(&debug_logs, "features.aggregate.empty_subset").is_some());
}

#[test]
fn normalization_warns_about_anonymous_rows_and_stripped_columns() {
    let mut raw = RawEventTable::new(
        ["userId", "ts", "page", "firstName"]
            .iter()
            .map(|h| h.to_string())
            .collect(),
    );
    raw.push_row(vec!["7".into(), "1000".into(), "Home".into(), "Ada".into()]);
    raw.push_row(vec!["".into(), "2000".into(), "Home".into(), "".into()]);

    let logs = capture_logs(Level::INFO, || {
        let (events, report) =
            normalize_events(&raw, &NormalizeConfig::default()).expect("normalize succeeds");
        assert_eq!(events.len(), 1);
        assert_eq!(report.dropped_anonymous_rows, 1);
    });

    let stripped = find_event(&logs, "events.normalize.columns_stripped").expect("strip warning");
    assert_eq!(stripped["level"], "WARN");
    assert!(find_event(&logs, "events.normalize.anonymous_dropped").is_some());
    assert!(find_event(&logs, "events.normalize.finish").is_some());
}

#[test]
fn training_run_emits_stage_events_in_order() {
    let mut raw = RawEventTable::new(
        ["userId", "ts", "page", "sessionId"]
            .iter()
            .map(|h| h.to_string())
            .collect(),
    );
    for (user, day, page) in [
        ("1", 0, "NextSong"),
        ("1", 20, "NextSong"),
        ("1", 30, "Cancellation Confirmation"),
        ("2", 1, "NextSong"),
        ("2", 25, "NextSong"),
    ] {
        raw.push_row(vec![
            user.to_string(),
            (day * DAY_MS).to_string(),
            page.to_string(),
            "1".to_string(),
        ]);
    }

    let logs = capture_logs(Level::INFO, || {
        let cfg = PipelineConfig::default();
        log_run_start(&LoggingConfig::default(), &cfg);
        build_training_table(&raw, &cfg).expect("training run succeeds");
    });

    let order: Vec<&str> = logs
        .iter()
        .filter_map(|line| line["fields"]["event"].as_str())
        .collect();
    let position = |name: &str| {
        order
            .iter()
            .position(|event| *event == name)
            .unwrap_or_else(|| panic!("missing {name} in {order:?}"))
    };

    assert!(position("run.start") < position("events.normalize.finish"));
    assert!(position("events.normalize.finish") < position("snapshots.generate.finish"));
    assert!(position("snapshots.generate.finish") < position("features.aggregate.finish"));
    assert!(position("features.aggregate.finish") < position("pipeline.training.finish"));

    let run_start = find_event(&logs, "run.start").expect("run.start");
    assert_eq!(run_start["fields"]["seed"], 42);
}
