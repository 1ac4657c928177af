use std::fs::File;
use std::io::{BufReader, BufWriter};

use churn_features::{
    build_feature_schema, build_inference_table, build_legacy_table, build_training_table,
    cancellation_gap_stats, label_churn_window, normalize_events, read_feature_table_csv,
    read_raw_events_csv, schema_from_json, schema_to_json, write_feature_table_csv,
    FeatureAggregationConfig, NormalizeConfig, NormalizeError, PipelineConfig, PipelineError,
    RawEventTable, TableError, CHURN_PAGE, DAY_MS, DEFAULT_CHURN_WINDOW_DAYS,
};
use tempfile::NamedTempFile;

const BASE_TS: i64 = 1_538_352_000_000; // 2018-10-01T00:00:00Z
const MAC_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_9_4) AppleWebKit/537.36 (KHTML, like Gecko)";
const WINDOWS_AGENT: &str = "Mozilla/5.0 (Windows NT 6.1; WOW64; rv:31.0) Gecko/20100101";
const LINUX_AGENT: &str = "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:31.0) Gecko/20100101";

#[test]
fn training_table_is_built_from_csv_event_log() {
    let raw = raw_log();

    let run = build_training_table(&raw, &PipelineConfig::default()).expect("training run");

    assert_eq!(run.normalize.input_rows, 14);
    assert_eq!(run.normalize.dropped_anonymous_rows, 1);
    assert_eq!(
        run.normalize.stripped_columns,
        vec!["auth".to_string(), "firstName".to_string()]
    );
    assert!(!run.downsample.applied);
    assert_eq!(run.downsample.input_users, 3);

    assert_eq!(run.table.rows.len(), run.snapshots.len());
    assert_eq!(run.snapshot_summary.positives, 3);
    assert!(run.table.rows.iter().all(|row| row.target.is_some()));

    let mut users: Vec<&str> = run.table.rows.iter().map(|r| r.user_id.as_str()).collect();
    users.dedup();
    assert_eq!(users, vec!["10", "20", "30"]);

    let positives: Vec<_> = run
        .table
        .rows
        .iter()
        .filter(|row| row.target == Some(1))
        .collect();
    assert!(positives.iter().all(|row| row.user_id == "10"));
    let gender_idx = run.table.schema.column_index("gender_male").unwrap();
    assert!(positives.iter().all(|row| row.values[gender_idx] == 1.0));
}

#[test]
fn feature_table_survives_csv_file_round_trip() {
    let run = build_training_table(&raw_log(), &PipelineConfig::default()).expect("training run");
    let file = NamedTempFile::new().expect("temp file");

    write_feature_table_csv(&run.table, BufWriter::new(file.reopen().expect("reopen")))
        .expect("write table");
    let reader = BufReader::new(File::open(file.path()).expect("open table"));
    let restored = read_feature_table_csv(reader, &run.table.schema).expect("read table");

    assert_eq!(restored.schema, run.table.schema);
    assert_eq!(restored.rows, run.table.rows);
    assert!(restored.region_frequencies.is_empty());
}

#[test]
fn reading_under_a_different_schema_is_rejected() {
    let run = build_training_table(&raw_log(), &PipelineConfig::default()).expect("training run");
    let mut buf = Vec::new();
    write_feature_table_csv(&run.table, &mut buf).expect("write table");

    let narrow = build_feature_schema(&FeatureAggregationConfig {
        windows_days: vec![7, 30],
        ..FeatureAggregationConfig::default()
    });
    let err = read_feature_table_csv(buf.as_slice(), &narrow).expect_err("header mismatch");

    assert!(matches!(err, TableError::HeaderMismatch { .. }));
}

#[test]
fn inference_table_uses_global_cutoff_and_training_layout() {
    let cfg = PipelineConfig::default();
    let train = build_training_table(&raw_log(), &cfg).expect("training run");
    let json = schema_to_json(&train.table.schema).expect("schema json");
    let train_schema = schema_from_json(&json).expect("schema from json");
    assert_eq!(train_schema, train.table.schema);

    let run = build_inference_table(&raw_log(), &cfg, Some(&train_schema)).expect("inference");

    assert_eq!(run.cutoff_ts_ms_utc, Some(BASE_TS + 30 * DAY_MS));
    assert_eq!(run.table.schema, train_schema);
    assert_eq!(run.table.rows.len(), 3);
    for row in &run.table.rows {
        assert_eq!(row.cutoff_ts_ms_utc, BASE_TS + 30 * DAY_MS);
        assert_eq!(row.target, None);
    }

    let recency = run.table.schema.column_index("days_since_last_session").unwrap();
    let churned = run.table.rows.iter().find(|row| row.user_id == "10").unwrap();
    assert_eq!(churned.values[recency], 10.0);
}

#[test]
fn per_user_table_labels_users_who_ever_cancelled() {
    let table = build_legacy_table(&raw_log(), &PipelineConfig::default()).expect("legacy table");

    let labels: Vec<(&str, Option<u8>)> = table
        .rows
        .iter()
        .map(|row| (row.user_id.as_str(), row.target))
        .collect();
    assert_eq!(labels, vec![("10", Some(1)), ("20", Some(0)), ("30", Some(0))]);

    let recency = table.schema.column_index("days_since_last_session").unwrap();
    assert!(table.rows.iter().all(|row| row.values[recency] == 0.0));
}

#[test]
fn cancellation_diagnostics_and_window_labels_on_normalized_log() {
    let (events, _) = normalize_events(&raw_log(), &NormalizeConfig::default()).expect("normalize");

    let gaps = cancellation_gap_stats(&events, CHURN_PAGE).expect("one cancellation");
    assert_eq!(gaps.count, 1);
    assert_eq!(gaps.median_days, 5.0);
    assert_eq!(gaps.max_days, 5.0);

    let labels = label_churn_window(&events, DEFAULT_CHURN_WINDOW_DAYS, CHURN_PAGE);
    let churned: Vec<u8> = events
        .iter()
        .zip(&labels)
        .filter(|(event, _)| event.user_id == "10")
        .map(|(_, label)| *label)
        .collect();
    assert_eq!(churned, vec![0, 0, 1, 1, 1]);
    assert!(events
        .iter()
        .zip(&labels)
        .filter(|(event, _)| event.user_id != "10")
        .all(|(_, label)| *label == 0));
}

#[test]
fn out_of_range_timestamps_fail_normalization_instead_of_snapshots() {
    let csv = "userId,ts,page\n1,1e300,NextSong\n2,1e299,NextSong\n";
    let raw = read_raw_events_csv(csv.as_bytes()).expect("raw csv parses");
    let cfg = PipelineConfig {
        downsample: None,
        ..PipelineConfig::default()
    };

    let err = build_training_table(&raw, &cfg).expect_err("timestamp must be rejected");

    assert!(matches!(
        err,
        PipelineError::Normalize(NormalizeError::ParseField { field: "ts", .. })
    ));
}

fn raw_log() -> RawEventTable {
    let mut csv = String::from(
        "ts,userId,sessionId,page,auth,status,song,artist,length,level,gender,registration,firstName,userAgent,location\n",
    );
    let mut row = |day: i64, minute: i64, user: &str, session: u32, page: &str, song: Option<(&str, &str, f64)>| {
        let (agent, location, gender, level, registration, first_name) = match user {
            "10" => (MAC_AGENT, "Bakersfield, CA", "M", "paid", BASE_TS - 30 * DAY_MS, "Ann"),
            "20" => (WINDOWS_AGENT, "Boston-Cambridge-Newton, MA-NH", "F", "free", BASE_TS - 60 * DAY_MS, "Bea"),
            _ => (LINUX_AGENT, "Austin, TX", "M", "free", BASE_TS, "Cal"),
        };
        let (title, artist, length) = match song {
            Some((title, artist, length)) => (title.to_string(), artist.to_string(), length.to_string()),
            None => (String::new(), String::new(), String::new()),
        };
        let ts = BASE_TS + day * DAY_MS + minute * 60_000;
        csv.push_str(&format!(
            "{ts},{user},{session},{page},Logged In,200,{title},{artist},{length},{level},{gender},{registration},{first_name},\"{agent}\",\"{location}\"\n"
        ));
    };

    row(0, 0, "10", 1, "NextSong", Some(("Yellow", "Coldplay", 266.0)));
    row(5, 0, "10", 2, "NextSong", Some(("Clocks", "Coldplay", 307.5)));
    row(10, 0, "10", 3, "Thumbs Down", None);
    row(15, 0, "10", 4, "NextSong", Some(("Yellow", "Coldplay", 266.0)));
    row(20, 0, "10", 5, CHURN_PAGE, None);
    row(1, 0, "20", 11, "NextSong", Some(("Hello", "Adele", 295.0)));
    row(8, 0, "20", 12, "NextSong", Some(("Skyfall", "Adele", 286.0)));
    row(8, 2, "20", 12, "Thumbs Up", None);
    row(30, 0, "20", 13, "NextSong", Some(("Hello", "Adele", 295.0)));
    row(2, 0, "30.0", 21, "Home", None);
    row(2, 10, "30.0", 21, "NextSong", Some(("Creep", "Radiohead", 238.6)));
    row(2, 14, "30.0", 21, "NextSong", Some(("Karma Police", "Radiohead", 264.0)));
    row(2, 20, "30.0", 21, "Roll Advert", None);
    csv.push_str(&format!("{},,,Home,Logged Out,200,,,,free,,,,,\n", BASE_TS + DAY_MS));

    read_raw_events_csv(csv.as_bytes()).expect("raw csv parses")
}
