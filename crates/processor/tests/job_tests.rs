//! End-to-end job tests
//!
//! Jobs run against in-memory and file sources with real timers, so every
//! wait below is bounded by a deadline instead of a fixed sleep.

use processor::checkpoint::{CheckpointStore, FsCheckpointStore, MemoryCheckpointStore};
use processor::config::{
    AggregateDef, AggregateFunction, AggregationSpec, AlertRule, BackpressureKind, FilterDef,
    ParseKind, StreamSpec, TransformDef, WindowSpec,
};
use processor::error::{ProcessorError, ValidationError};
use processor::metrics::EngineMetrics;
use processor::sink::{FileSink, MemorySink, SinkRecord};
use processor::source::{JsonLinesSource, MemorySource};
use processor::stages::MemoryAlertChannel;
use processor::supervisor::{JobContext, JobHandle, JobSupervisor};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream_analytics_types::{AlertSeverity, CompletionReason, Event, JobStatus, StreamId, WindowResult};
use tempfile::TempDir;

fn per_minute_spec(id: &str) -> StreamSpec {
    let mut spec = StreamSpec::new(id).with_aggregation(
        AggregationSpec::new(
            "per_minute",
            WindowSpec::tumbling(60_000),
            vec![
                AggregateDef::new("*", AggregateFunction::Count, "count"),
                AggregateDef::new("v", AggregateFunction::Sum, "sum"),
            ],
        )
        .group_by(&["key"]),
    );
    spec.source.poll_interval_ms = 5;
    spec.checkpoint.interval_ms = 20;
    spec
}

fn context(sink: &MemorySink, store: Arc<dyn CheckpointStore>) -> JobContext {
    JobContext::new()
        .with_sink(Arc::new(sink.clone()))
        .with_checkpoint_store(store)
        .with_metrics(Arc::new(EngineMetrics::default()))
}

fn event(key: &str, seconds: i64, v: i64) -> Event {
    Event::at_millis(json!({"key": key, "v": v}), seconds * 1_000)
}

fn sorted_windows(sink: &MemorySink) -> Vec<WindowResult> {
    let mut windows = sink.windows();
    windows.sort_by_key(|w| (w.group_key.clone(), w.window_start));
    windows
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_checkpoint_at(handle: &JobHandle, offset: u64) {
    eventually(&format!("checkpoint covering offset {}", offset), || {
        handle
            .run()
            .latest_checkpoint()
            .is_some_and(|c| c.last_offset == Some(offset))
    })
    .await;
}

#[tokio::test]
async fn test_job_emits_per_minute_counts() {
    let sink = MemorySink::new();
    let events = [0, 10, 30, 59, 61].iter().map(|&s| event("a", s, 1)).collect();

    let mut handle = JobSupervisor::start(
        per_minute_spec("clicks"),
        Box::new(MemorySource::new(events)),
        context(&sink, Arc::new(MemoryCheckpointStore::new())),
    )
    .await
    .unwrap();
    let run = handle.wait().await;

    assert_eq!(run.status, JobStatus::Stopped);
    assert_eq!(run.events_processed, 5);
    assert!(run.finished_at.is_some());
    // The final checkpoint is written on stop
    assert_eq!(run.latest_checkpoint().unwrap().last_offset, Some(4));

    let windows = sorted_windows(&sink);
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].value_f64("count"), Some(4.0));
    assert_eq!(windows[0].reason, CompletionReason::Watermark);
    assert_eq!(windows[1].window_start.timestamp_millis(), 60_000);
    assert_eq!(windows[1].value_f64("count"), Some(1.0));
    // Still open at the end of input, flushed by the stop
    assert_eq!(windows[1].reason, CompletionReason::Shutdown);
}

#[tokio::test]
async fn test_stages_and_alerts_run_before_aggregation() {
    let mut spec = per_minute_spec("orders");
    spec.filters.push(FilterDef {
        name: "positive".to_string(),
        condition: "v > 0".to_string(),
    });
    spec.transforms.push(TransformDef::Parse {
        field: "paid".to_string(),
        kind: ParseKind::Boolean,
    });
    spec.alerts.push(AlertRule {
        id: "big".to_string(),
        name: None,
        condition: "v >= 100".to_string(),
        severity: AlertSeverity::Critical,
        message: Some("large order {v} from {key}".to_string()),
        cooldown_ms: 0,
    });

    let events = vec![
        Event::at_millis(json!({"key": "a", "v": 5, "paid": "true"}), 1_000),
        Event::at_millis(json!({"key": "a", "v": -1, "paid": "true"}), 2_000),
        Event::at_millis(json!({"key": "a", "v": 150, "paid": "false"}), 3_000),
        Event::at_millis(json!({"key": "a", "v": 7, "paid": "perhaps"}), 4_000),
    ];

    let sink = MemorySink::new();
    let alerts = Arc::new(MemoryAlertChannel::new());
    let ctx = context(&sink, Arc::new(MemoryCheckpointStore::new())).with_alert_channel(alerts.clone());
    let mut handle = JobSupervisor::start(spec, Box::new(MemorySource::new(events)), ctx)
        .await
        .unwrap();
    let run = handle.wait().await;

    assert_eq!(run.status, JobStatus::Stopped);
    assert_eq!(run.events_processed, 2);
    assert_eq!(run.events_failed, 1);
    assert_eq!(run.errors.len(), 1);
    assert!(run.errors[0].message.contains("paid"));

    let windows = sorted_windows(&sink);
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].value_f64("count"), Some(2.0));
    assert_eq!(windows[0].value_f64("sum"), Some(155.0));

    eventually("alert notification", || alerts.len() == 1).await;
    let firing = &alerts.firings()[0];
    assert_eq!(firing.rule_id, "big");
    assert_eq!(firing.message, "large order 150 from a");
}

#[tokio::test]
async fn test_raw_events_are_forwarded() {
    let mut spec = per_minute_spec("raw");
    spec.emit_raw_events = true;
    let sink = MemorySink::new();
    let events = vec![event("a", 1, 1), event("b", 2, 2)];

    let mut handle = JobSupervisor::start(
        spec,
        Box::new(MemorySource::new(events)),
        context(&sink, Arc::new(MemoryCheckpointStore::new())),
    )
    .await
    .unwrap();
    handle.wait().await;

    let forwarded = sink.events();
    assert_eq!(forwarded.len(), 2);
    assert_eq!(forwarded[0].offset, Some(0));
    assert_eq!(forwarded[1].field("key"), Some(&json!("b")));
    assert_eq!(sink.windows().len(), 2);
}

#[tokio::test]
async fn test_consecutive_stage_errors_fail_job_without_checkpoint() {
    let mut spec = per_minute_spec("broken");
    spec.checkpoint.enabled = false;
    spec.limits.max_consecutive_stage_errors = 3;
    spec.transforms.push(TransformDef::Parse {
        field: "v".to_string(),
        kind: ParseKind::Number,
    });
    let events = (0..5)
        .map(|i| Event::at_millis(json!({"key": "a", "v": "not a number"}), i * 1_000))
        .collect();

    let sink = MemorySink::new();
    let mut handle = JobSupervisor::start(
        spec,
        Box::new(MemorySource::new(events)),
        context(&sink, Arc::new(MemoryCheckpointStore::new())),
    )
    .await
    .unwrap();
    let run = handle.wait().await;

    assert_eq!(run.status, JobStatus::Failed);
    assert_eq!(run.recoveries, 0);
    assert!(run.failure.as_deref().unwrap().contains("consecutive"));
    assert_eq!(run.events_failed, 3);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn test_checkpoint_abort_recover_round_trip() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let first_sink = MemorySink::new();

    // First run: ten events into [0, 60s), checkpointed, then killed
    let (source, writer) = MemorySource::open();
    let mut first = JobSupervisor::start(
        per_minute_spec("payments"),
        Box::new(source),
        context(&first_sink, Arc::clone(&store)),
    )
    .await
    .unwrap();
    let backlog: Vec<Event> = (0..10).map(|i| event("a", i * 5, 1)).collect();
    writer.extend(backlog.clone());
    wait_for_checkpoint_at(&first, 9).await;
    first.abort();
    assert_eq!(first.status(), JobStatus::Failed);
    assert!(first_sink.windows().is_empty());

    // Second run replays the whole log; the restored offset skips the first ten
    let mut spec = per_minute_spec("payments");
    spec.checkpoint.restore_on_start = true;
    let mut log = backlog;
    log.extend((0..5).map(|i| event("a", 61 + i, 10)));

    let second_sink = MemorySink::new();
    let mut second = JobSupervisor::start(
        spec,
        Box::new(MemorySource::new(log)),
        context(&second_sink, Arc::clone(&store)),
    )
    .await
    .unwrap();
    let run = second.wait().await;
    assert_eq!(run.status, JobStatus::Stopped);
    assert_eq!(run.events_processed, 5);

    let windows = sorted_windows(&second_sink);
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].window_start.timestamp_millis(), 0);
    assert_eq!(windows[0].value_f64("count"), Some(10.0));
    assert_eq!(windows[0].value_f64("sum"), Some(10.0));
    assert_eq!(windows[1].value_f64("count"), Some(5.0));
    assert_eq!(windows[1].value_f64("sum"), Some(50.0));
}

#[tokio::test]
async fn test_spilled_events_survive_abort_and_recovery() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let mut spec = per_minute_spec("spilled");
    spec.backpressure.kind = BackpressureKind::Spill;
    spec.backpressure.threshold = 2;
    let log: Vec<Event> = (0..201)
        .map(|i| Event::at_millis(json!({"key": "a", "v": 1}), i * 100))
        .collect();

    // First run: most of the backlog spills, then a late event overtakes it
    let first_sink = MemorySink::new();
    let (source, writer) = MemorySource::open();
    let mut first = JobSupervisor::start(
        spec.clone(),
        Box::new(source),
        context(&first_sink, Arc::clone(&store)),
    )
    .await
    .unwrap();
    writer.extend(log[..200].to_vec());
    eventually("spilled backlog draining", || first.run().events_processed >= 10).await;
    writer.push(log[200].clone());
    eventually("late event processed", || first.run().events_processed >= 30).await;
    let written = first.run().checkpoints.len();
    eventually("checkpoints after the late event", || {
        first.run().checkpoints.len() >= written + 2
    })
    .await;
    first.abort();

    // The checkpoint never commits past an event it has not applied
    let latest = store
        .get_latest(&StreamId::new("spilled").unwrap())
        .await
        .unwrap()
        .unwrap();
    let applied: u64 = latest.windows.iter().map(|w| w.member_count).sum();
    let committed = latest.last_offset.map_or(0, |o| o + 1);
    assert!(
        applied >= committed,
        "checkpoint commits {} offsets but holds {} events",
        committed,
        applied
    );

    // Second run replays everything after the committed offset
    spec.checkpoint.restore_on_start = true;
    let second_sink = MemorySink::new();
    let mut second = JobSupervisor::start(
        spec,
        Box::new(MemorySource::new(log)),
        context(&second_sink, Arc::clone(&store)),
    )
    .await
    .unwrap();
    let run = second.wait().await;
    assert_eq!(run.status, JobStatus::Stopped);

    let windows = sorted_windows(&second_sink);
    assert_eq!(windows.len(), 1);
    let counted = windows[0].value_f64("count").unwrap();
    assert!(counted >= 201.0, "only {} of 201 events counted", counted);
}

#[tokio::test]
async fn test_idle_watermark_completes_session() {
    let mut spec = StreamSpec::new("visits").with_aggregation(
        AggregationSpec::new(
            "sessions",
            WindowSpec::session(100),
            vec![AggregateDef::new("*", AggregateFunction::Count, "count")],
        )
        .group_by(&["key"]),
    );
    spec.source.poll_interval_ms = 5;
    spec.checkpoint.enabled = false;
    spec.watermark.idle_timeout_ms = 50;
    spec.watermark.idle_advance = true;

    let sink = MemorySink::new();
    let (source, writer) = MemorySource::open();
    let mut handle = JobSupervisor::start(
        spec,
        Box::new(source),
        context(&sink, Arc::new(MemoryCheckpointStore::new())),
    )
    .await
    .unwrap();

    // Session [1000, 1120) with no later event to push the watermark past it
    writer.extend([1_000, 1_010, 1_020].map(|t| Event::at_millis(json!({"key": "a"}), t)));
    eventually("session completed while idle", || !sink.windows().is_empty()).await;
    assert_eq!(handle.status(), JobStatus::Running);

    let windows = sink.windows();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].value_f64("count"), Some(3.0));
    assert_eq!(windows[0].window_end.map(|t| t.timestamp_millis()), Some(1_120));
    assert_eq!(windows[0].reason, CompletionReason::Watermark);

    writer.close();
    assert_eq!(handle.wait().await.status, JobStatus::Stopped);
}

#[tokio::test]
async fn test_watermark_stall_is_counted() {
    let mut spec = per_minute_spec("quiet");
    spec.watermark.idle_timeout_ms = 20;
    let metrics = Arc::new(EngineMetrics::default());
    let ctx = context(&MemorySink::new(), Arc::new(MemoryCheckpointStore::new()))
        .with_metrics(Arc::clone(&metrics));

    let (source, writer) = MemorySource::open();
    let mut handle = JobSupervisor::start(spec, Box::new(source), ctx).await.unwrap();
    writer.push(event("a", 1, 1));

    let stream = metrics.for_stream(&StreamId::new("quiet").unwrap());
    eventually("stall counted", || stream.watermark_stalls.get() >= 1).await;
    handle.stop().await;
}

#[tokio::test]
async fn test_recovery_attempts_are_bounded() {
    let mut spec = per_minute_spec("poisoned");
    spec.limits.max_consecutive_stage_errors = 3;
    spec.limits.max_recovery_attempts = 2;
    spec.transforms.push(TransformDef::Parse {
        field: "v".to_string(),
        kind: ParseKind::Number,
    });

    let sink = MemorySink::new();
    let (source, writer) = MemorySource::open();
    let mut handle = JobSupervisor::start(
        spec,
        Box::new(source),
        context(&sink, Arc::new(MemoryCheckpointStore::new())),
    )
    .await
    .unwrap();

    writer.extend((0..3).map(|i| event("a", i, 1)));
    wait_for_checkpoint_at(&handle, 2).await;

    // Every replay after recovery hits the same three bad events
    writer.extend((3..6).map(|i| Event::at_millis(json!({"key": "a", "v": "bad"}), i * 1_000)));
    let run = handle.wait().await;

    assert_eq!(run.status, JobStatus::Failed);
    assert_eq!(run.recoveries, 2);
    assert!(run.failure.as_deref().unwrap().contains("recovery failed"));
}

#[tokio::test]
async fn test_stop_flushes_open_windows_and_checkpoints() {
    let sink = MemorySink::new();
    let store = Arc::new(MemoryCheckpointStore::new());
    let (source, writer) = MemorySource::open();
    let mut handle = JobSupervisor::start(
        per_minute_spec("sessions"),
        Box::new(source),
        context(&sink, store.clone()),
    )
    .await
    .unwrap();

    writer.extend(vec![event("a", 1, 1), event("b", 2, 1), event("a", 3, 1)]);
    eventually("events processed", || handle.run().events_processed == 3).await;
    assert_eq!(handle.status(), JobStatus::Running);

    let run = handle.stop().await;
    assert_eq!(run.status, JobStatus::Stopped);
    let latest = store
        .get_latest(&StreamId::new("sessions").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.last_offset, Some(2));
    assert_eq!(latest.windows.len(), 2);

    let windows = sorted_windows(&sink);
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].group.get("key"), Some(&json!("a")));
    assert_eq!(windows[0].value_f64("count"), Some(2.0));
    assert!(windows.iter().all(|w| w.reason == CompletionReason::Shutdown));
}

#[tokio::test]
async fn test_pause_holds_processing_until_resume() {
    let sink = MemorySink::new();
    let (source, writer) = MemorySource::open();
    let mut handle = JobSupervisor::start(
        per_minute_spec("paused"),
        Box::new(source),
        context(&sink, Arc::new(MemoryCheckpointStore::new())),
    )
    .await
    .unwrap();
    assert_eq!(handle.wait_for_status(JobStatus::Running).await, JobStatus::Running);

    handle.pause().await;
    assert_eq!(handle.wait_for_status(JobStatus::Paused).await, JobStatus::Paused);
    writer.push(event("a", 1, 1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.run().events_processed, 0);

    handle.resume().await;
    eventually("event processed after resume", || handle.run().events_processed == 1).await;
    writer.close();
    let run = handle.wait().await;
    assert_eq!(run.status, JobStatus::Stopped);
}

#[tokio::test]
async fn test_invalid_spec_is_rejected_before_start() {
    let mut window = WindowSpec::session(30_000);
    window.slide_ms = Some(5_000);
    let spec = StreamSpec::new("bad").with_aggregation(AggregationSpec::new(
        "sessions",
        window,
        vec![AggregateDef::new("*", AggregateFunction::Count, "count")],
    ));

    let result = JobSupervisor::start(spec, Box::new(MemorySource::new(vec![])), JobContext::new()).await;
    assert!(matches!(
        result,
        Err(ProcessorError::Validation(ValidationError::Unsupported { .. }))
    ));
}

#[tokio::test]
async fn test_json_lines_file_to_file_sink() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("events.jsonl");
    let output = dir.path().join("out.jsonl");
    let lines: Vec<String> = [(0, "a", 3), (20, "b", 4), (45, "a", 5), (75, "a", 6)]
        .iter()
        .map(|(s, key, v)| json!({"ts": s * 1_000, "key": key, "v": v}).to_string())
        .collect();
    tokio::fs::write(&input, lines.join("\n") + "\n").await.unwrap();

    let mut spec = per_minute_spec("files");
    spec.source.time_field = Some("ts".to_string());
    let source = JsonLinesSource::new(&input, spec.source.time_field.clone());
    let store = Arc::new(FsCheckpointStore::new(dir.path().join("checkpoints"), 3));
    let ctx = JobContext::new()
        .with_sink(Arc::new(FileSink::open(&output).await.unwrap()))
        .with_checkpoint_store(store.clone())
        .with_metrics(Arc::new(EngineMetrics::default()));

    let mut handle = JobSupervisor::start(spec, Box::new(source), ctx).await.unwrap();
    let run = handle.wait().await;
    assert_eq!(run.status, JobStatus::Stopped);
    assert_eq!(run.events_processed, 4);

    let written = tokio::fs::read_to_string(&output).await.unwrap();
    let records: Vec<SinkRecord> = written
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let mut sums: Vec<(String, i64, Value)> = records
        .iter()
        .filter_map(SinkRecord::as_window)
        .map(|w| {
            (
                w.group_key.clone(),
                w.window_start.timestamp_millis(),
                w.values["sum"].clone(),
            )
        })
        .collect();
    sums.sort_by(|x, y| (&x.0, x.1).cmp(&(&y.0, y.1)));
    assert_eq!(sums.len(), 3);
    assert_eq!(sums[0].1, 0);
    assert_eq!(sums[0].2.as_f64(), Some(8.0));
    assert_eq!(sums[1].1, 60_000);
    assert_eq!(sums[2].2.as_f64(), Some(4.0));

    let stream = StreamId::new("files").unwrap();
    let refs = store.list(&stream).await.unwrap();
    assert!(!refs.is_empty());
    assert_eq!(refs.last().unwrap().last_offset, Some(3));
}
