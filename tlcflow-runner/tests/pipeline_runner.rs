//! Integration tests for the runner: the full four-task chain against an
//! in-memory source, the filesystem object store and the CSV warehouse.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use flate2::write::GzEncoder;
use tlcflow_core::config::{StorageBackend, WarehouseBackend};
use tlcflow_core::fetch::FetchError;
use tlcflow_core::warehouse::TableSchema;
use tlcflow_core::{
    ConfigError, LocalObjectStore, LocalWarehouse, ObjectStore, PipelineConfig, RunKind,
    SourceFetcher,
};
use tlcflow_runner::{
    trip_data_pipeline, Alert, AlertKind, LockError, OutboxNotifier, PipelineRunner,
    PipelineServices, RunLock, RunState, RunnerError, TaskState, TASK_DOWNLOAD, TASK_END,
    TASK_LOAD, TASK_START,
};

const ROW: &str = "2,2021-01-01 00:15:56,2021-01-01 00:19:52,N,1,43,151,1,1.01,5.5,0.5,0.5,0,0,,0.3,6.8,2,1,0";

fn trips(n: usize) -> Vec<u8> {
    let mut text = TableSchema::green_trips().column_names().join(",");
    text.push('\n');
    for _ in 0..n {
        text.push_str(ROW);
        text.push('\n');
    }
    let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(text.as_bytes()).unwrap();
    enc.finish().unwrap()
}

/// Serves gzipped files by name; fails the first `transient` calls with 503.
struct FakeSource {
    files: HashMap<String, Vec<u8>>,
    transient: AtomicU32,
    calls: AtomicU32,
}

impl FakeSource {
    fn new(files: &[(&str, Vec<u8>)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(name, body)| (name.to_string(), body.clone()))
                .collect(),
            transient: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    fn failing_first(self, n: u32) -> Self {
        self.transient.store(n, Ordering::SeqCst);
        self
    }
}

impl SourceFetcher for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    fn fetch_to(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.transient.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchError::Status {
                url: url.to_string(),
                status: 503,
            });
        }
        let name = url.rsplit('/').next().unwrap_or_default();
        match self.files.get(name) {
            Some(body) => {
                sink.write_all(body).unwrap();
                Ok(body.len() as u64)
            }
            None => Err(FetchError::NotFound {
                url: url.to_string(),
            }),
        }
    }
}

struct Env {
    dir: tempfile::TempDir,
    config: PipelineConfig,
    store: Arc<LocalObjectStore>,
    warehouse: Arc<LocalWarehouse>,
}

impl Env {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.storage.backend = StorageBackend::Local;
        config.storage.bucket = Some("gs://trip-bucket".into());
        config.storage.root = dir.path().join("objects");
        config.warehouse.backend = WarehouseBackend::Local;
        config.warehouse.root = dir.path().join("warehouse");
        config.runtime.state_dir = dir.path().join("state");
        config.runtime.workspace_root = Some(dir.path().join("work"));
        config.retry.delay_secs = 0;
        config.alert.email = vec!["ops@example.com".into()];
        config.alert.outbox = Some(dir.path().join("outbox.jsonl"));
        config.validate().unwrap();

        let store = Arc::new(LocalObjectStore::new(config.storage.root.clone()));
        let warehouse = Arc::new(LocalWarehouse::new(config.warehouse.root.clone(), store.clone()));
        Self {
            dir,
            config,
            store,
            warehouse,
        }
    }

    fn runner(&self, source: Arc<FakeSource>) -> PipelineRunner {
        let services = PipelineServices {
            fetcher: source,
            store: self.store.clone(),
            warehouse: self.warehouse.clone(),
            notifier: Arc::new(OutboxNotifier::new(self.outbox())),
        };
        trip_data_pipeline(&self.config, services).unwrap()
    }

    fn outbox(&self) -> PathBuf {
        self.dir.path().join("outbox.jsonl")
    }

    fn alerts(&self) -> Vec<Alert> {
        match std::fs::read_to_string(self.outbox()) {
            Ok(text) => text.lines().map(|l| serde_json::from_str(l).unwrap()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn table_rows(&self) -> u64 {
        self.warehouse.row_count(&self.config.table()).unwrap()
    }

    fn work_dir_is_empty(&self) -> bool {
        let work = self.dir.path().join("work");
        !work.exists() || std::fs::read_dir(work).unwrap().next().is_none()
    }
}

fn logical(y: i32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, 2, 6, 0, 0).unwrap()
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn task_states(record: &tlcflow_runner::RunRecord) -> Vec<(&str, TaskState)> {
    record
        .tasks
        .iter()
        .map(|t| (t.task_id.as_str(), t.state))
        .collect()
}

#[test]
fn successful_run_completes_all_four_tasks() {
    let env = Env::new();
    let source = Arc::new(FakeSource::new(&[("green_tripdata_2021-01.csv.gz", trips(7))]));
    let runner = env.runner(source);

    assert_eq!(
        runner.definition().task_ids(),
        vec![TASK_START, TASK_DOWNLOAD, TASK_LOAD, TASK_END]
    );

    let outcome = runner.run(logical(2021, 1), RunKind::Manual).unwrap();
    assert!(outcome.succeeded());
    assert_eq!(
        task_states(&outcome.record),
        vec![
            (TASK_START, TaskState::Success),
            (TASK_DOWNLOAD, TaskState::Success),
            (TASK_LOAD, TaskState::Success),
            (TASK_END, TaskState::Success),
        ]
    );
    assert_eq!(outcome.record.run_id, "manual__2021-01-02T06:00:00+00:00");

    let object = env.store.get("trip-bucket", "green/green_tripdata_2021-01.csv").unwrap();
    assert_eq!(String::from_utf8(object).unwrap().lines().count(), 8);
    assert_eq!(env.table_rows(), 7);
    assert!(env.work_dir_is_empty());
    assert!(env.alerts().is_empty());

    let history = runner.history().read_all().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0], outcome.record);
}

#[test]
fn two_months_append_into_one_table() {
    let env = Env::new();
    let source = Arc::new(FakeSource::new(&[
        ("green_tripdata_2021-01.csv.gz", trips(3)),
        ("green_tripdata_2021-02.csv.gz", trips(5)),
    ]));
    let runner = env.runner(source);

    assert!(runner.run(logical(2021, 1), RunKind::Manual).unwrap().succeeded());
    assert!(runner.run(logical(2021, 2), RunKind::Manual).unwrap().succeeded());

    assert!(env.store.exists("trip-bucket", "green/green_tripdata_2021-01.csv").unwrap());
    assert!(env.store.exists("trip-bucket", "green/green_tripdata_2021-02.csv").unwrap());
    assert_eq!(env.table_rows(), 8);
}

#[test]
fn missing_source_fails_after_retries_and_alerts() {
    let env = Env::new();
    let source = Arc::new(FakeSource::new(&[]));
    let runner = env.runner(source.clone());

    let outcome = runner.run(logical(2021, 1), RunKind::Scheduled).unwrap();
    assert!(!outcome.succeeded());
    assert_eq!(outcome.record.state, RunState::Failed);
    assert_eq!(
        task_states(&outcome.record),
        vec![
            (TASK_START, TaskState::Success),
            (TASK_DOWNLOAD, TaskState::Failed),
            (TASK_LOAD, TaskState::UpstreamFailed),
            (TASK_END, TaskState::UpstreamFailed),
        ]
    );
    let download = outcome.record.failed_task().unwrap();
    assert_eq!(download.attempts, 3);
    assert!(download.error.as_deref().unwrap_or_default().contains("not found"));
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);

    assert!(!env.store.exists("trip-bucket", "green/green_tripdata_2021-01.csv").unwrap());
    assert_eq!(env.table_rows(), 0);
    assert!(env.work_dir_is_empty());

    let alerts = env.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Failure);
    assert_eq!(alerts[0].task_id, TASK_DOWNLOAD);
    assert_eq!(alerts[0].attempt, 3);
    assert_eq!(alerts[0].recipients, vec!["ops@example.com".to_string()]);
}

#[test]
fn transient_failure_recovers_on_retry() {
    let mut env = Env::new();
    env.config.alert.email_on_retry = true;
    let source = Arc::new(
        FakeSource::new(&[("green_tripdata_2021-01.csv.gz", trips(2))]).failing_first(1),
    );
    let runner = env.runner(source);

    let outcome = runner.run(logical(2021, 1), RunKind::Manual).unwrap();
    assert!(outcome.succeeded());
    let download = &outcome.record.tasks[1];
    assert_eq!(download.attempts, 2);

    let alerts = env.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Retry);
}

#[test]
fn catch_up_runs_due_months_once() {
    let mut env = Env::new();
    env.config.pipeline.start_date = day(2020, 11, 1);
    let source = Arc::new(FakeSource::new(&[
        ("green_tripdata_2020-11.csv.gz", trips(1)),
        ("green_tripdata_2020-12.csv.gz", trips(2)),
        ("green_tripdata_2021-01.csv.gz", trips(3)),
    ]));
    let runner = env.runner(source);
    let now = Utc.with_ymd_and_hms(2021, 2, 10, 0, 0, 0).unwrap();

    let outcomes = runner.catch_up(now).unwrap();
    let dates: Vec<_> = outcomes.iter().map(|o| o.record.logical_date).collect();
    assert_eq!(dates, vec![logical(2020, 11), logical(2020, 12), logical(2021, 1)]);
    assert!(outcomes.iter().all(|o| o.succeeded()));
    assert_eq!(env.table_rows(), 6);

    assert!(runner.catch_up(now).unwrap().is_empty());
}

#[test]
fn catch_up_halts_at_first_failure() {
    let mut env = Env::new();
    env.config.pipeline.start_date = day(2020, 11, 1);
    env.config.retry.retries = 0;
    let source = Arc::new(FakeSource::new(&[
        ("green_tripdata_2020-11.csv.gz", trips(1)),
        ("green_tripdata_2021-01.csv.gz", trips(3)),
    ]));
    let runner = env.runner(source);
    let now = Utc.with_ymd_and_hms(2021, 2, 10, 0, 0, 0).unwrap();

    let outcomes = runner.catch_up(now).unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].succeeded());
    assert!(!outcomes[1].succeeded());
    assert_eq!(env.table_rows(), 1);
}

#[test]
fn backfill_continues_past_failed_month() {
    let mut env = Env::new();
    env.config.retry.retries = 0;
    let source = Arc::new(FakeSource::new(&[
        ("green_tripdata_2020-11.csv.gz", trips(1)),
        ("green_tripdata_2021-01.csv.gz", trips(3)),
    ]));
    let runner = env.runner(source);

    let outcomes = runner.backfill(day(2020, 11, 1), day(2021, 1, 31)).unwrap();
    let states: Vec<_> = outcomes.iter().map(|o| o.record.state).collect();
    assert_eq!(states, vec![RunState::Success, RunState::Failed, RunState::Success]);
    assert!(outcomes.iter().all(|o| o.record.kind == RunKind::Backfill));
    assert_eq!(env.table_rows(), 4);
}

#[test]
fn held_lock_blocks_second_runner() {
    let env = Env::new();
    let runner = env.runner(Arc::new(FakeSource::new(&[])));
    let _held =
        RunLock::acquire(&env.config.runtime.state_dir, &env.config.pipeline.dag_id).unwrap();

    let err = runner.run(logical(2021, 1), RunKind::Manual).unwrap_err();
    assert!(matches!(err, RunnerError::Lock(LockError::AlreadyRunning { .. })));
}

#[test]
fn stale_workspaces_are_swept_under_lock() {
    let env = Env::new();
    let stale = env.dir.path().join("work").join("tlcflow-stale");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("partial.csv.gz"), b"half").unwrap();

    let source = Arc::new(FakeSource::new(&[("green_tripdata_2021-01.csv.gz", trips(1))]));
    env.runner(source).run(logical(2021, 1), RunKind::Manual).unwrap();
    assert!(!Path::new(&stale).exists());
}

#[test]
fn invalid_schedule_is_rejected_at_wiring() {
    let mut env = Env::new();
    env.config.pipeline.schedule = "0 6 * * 1".into();
    let services = PipelineServices {
        fetcher: Arc::new(FakeSource::new(&[])),
        store: env.store.clone(),
        warehouse: env.warehouse.clone(),
        notifier: Arc::new(tlcflow_runner::LogNotifier),
    };
    assert!(matches!(
        trip_data_pipeline(&env.config, services),
        Err(ConfigError::InvalidSchedule { .. })
    ));
}

#[test]
fn catch_up_disabled_runs_latest_interval_only() {
    let mut env = Env::new();
    env.config.pipeline.start_date = day(2020, 11, 1);
    env.config.pipeline.catchup = false;
    let source = Arc::new(FakeSource::new(&[
        ("green_tripdata_2020-11.csv.gz", trips(1)),
        ("green_tripdata_2020-12.csv.gz", trips(2)),
        ("green_tripdata_2021-01.csv.gz", trips(3)),
    ]));
    let runner = env.runner(source);
    let now = Utc.with_ymd_and_hms(2021, 2, 10, 0, 0, 0).unwrap();

    let outcomes = runner.catch_up(now).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].record.logical_date, logical(2021, 1));
    assert_eq!(env.table_rows(), 3);
}
