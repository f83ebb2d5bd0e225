//! Pipeline runner.
//!
//! Executes the task chain for one logical date at a time under the run lock:
//! each task gets up to `retries + 1` attempts, a task that exhausts them
//! raises an alert and marks every later task `upstream_failed`. The finished
//! run is appended to the history.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tlcflow_core::{ConfigError, RunContext, RunKind, SourceLocator, Workspace};

use crate::alert::{Alert, AlertKind, AlertNotifier, AlertPolicy};
use crate::definition::PipelineDefinition;
use crate::history::{HistoryError, RunHistory, RunRecord, RunState, TaskRecord, TaskState};
use crate::lock::{LockError, RunLock};
use crate::operator::{Operator, TaskContext, TaskError, TaskOutput};
use crate::retry::RetryPolicy;
use crate::schedule::MonthlySchedule;

/// Failures of the runner itself, as opposed to task failures, which are
/// recorded in the [`RunOutcome`].
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to sweep stale workspaces: {0}")]
    Sweep(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub record: RunRecord,
    pub outputs: BTreeMap<String, TaskOutput>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.record.succeeded()
    }
}

pub struct PipelineRunner {
    definition: PipelineDefinition,
    schedule: MonthlySchedule,
    start_date: NaiveDate,
    catchup: bool,
    locator: SourceLocator,
    bucket: String,
    retry: RetryPolicy,
    alerts: AlertPolicy,
    notifier: Arc<dyn AlertNotifier>,
    history: RunHistory,
    state_dir: PathBuf,
    workspace_root: Option<PathBuf>,
}

impl PipelineRunner {
    pub fn new(
        definition: PipelineDefinition,
        schedule: MonthlySchedule,
        start_date: NaiveDate,
        locator: SourceLocator,
        bucket: impl Into<String>,
        state_dir: impl Into<PathBuf>,
        notifier: Arc<dyn AlertNotifier>,
    ) -> Self {
        let state_dir = state_dir.into();
        let history = RunHistory::for_pipeline(&state_dir, definition.dag_id());
        Self {
            definition,
            schedule,
            start_date,
            catchup: true,
            locator,
            bucket: bucket.into(),
            retry: RetryPolicy::default(),
            alerts: AlertPolicy::default(),
            notifier,
            history,
            state_dir,
            workspace_root: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_alerts(mut self, alerts: AlertPolicy) -> Self {
        self.alerts = alerts;
        self
    }

    /// When off, catch-up only considers the most recent due interval.
    pub fn with_catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    /// Root swept for stale workspaces once the lock is held.
    pub fn with_workspace_root(mut self, root: Option<PathBuf>) -> Self {
        self.workspace_root = root;
        self
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn schedule(&self) -> &MonthlySchedule {
        &self.schedule
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start_date
    }

    pub fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    fn acquire(&self) -> Result<RunLock, RunnerError> {
        let lock = RunLock::acquire(&self.state_dir, self.definition.dag_id())?;
        if let Some(root) = &self.workspace_root {
            let swept = Workspace::sweep_stale(root).map_err(RunnerError::Sweep)?;
            if swept > 0 {
                tracing::warn!(count = swept, root = %root.display(), "removed stale workspaces");
            }
        }
        Ok(lock)
    }

    /// Run the chain once for `logical_date`.
    pub fn run(
        &self,
        logical_date: DateTime<Utc>,
        kind: RunKind,
    ) -> Result<RunOutcome, RunnerError> {
        let _lock = self.acquire()?;
        self.run_locked(logical_date, kind)
    }

    /// Run every due interval since the start date that has no successful
    /// run yet, oldest first. Stops at the first failed run.
    ///
    /// With catch-up disabled only the latest due interval is considered.
    pub fn catch_up(&self, now: DateTime<Utc>) -> Result<Vec<RunOutcome>, RunnerError> {
        let _lock = self.acquire()?;
        let done = self.history.succeeded_dates()?;
        let mut due = self.schedule.due_logical_dates(self.start_date, now);
        if !self.catchup {
            due = due.pop().into_iter().collect();
        }
        let pending: Vec<_> = due.into_iter().filter(|d| !done.contains(d)).collect();
        tracing::info!(pending = pending.len(), "catching up");

        let mut outcomes = Vec::new();
        for logical_date in pending {
            let outcome = self.run_locked(logical_date, RunKind::Scheduled)?;
            let failed = !outcome.succeeded();
            outcomes.push(outcome);
            if failed {
                tracing::error!(logical_date = %logical_date, "catch-up halted by failed run");
                break;
            }
        }
        Ok(outcomes)
    }

    /// Run every interval from `from` through `to`, ignoring history. A
    /// failed month does not stop later months.
    pub fn backfill(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<RunOutcome>, RunnerError> {
        let _lock = self.acquire()?;
        let dates = self.schedule.logical_dates_between(from, to);
        tracing::info!(runs = dates.len(), %from, %to, "backfilling");

        let mut outcomes = Vec::with_capacity(dates.len());
        for logical_date in dates {
            outcomes.push(self.run_locked(logical_date, RunKind::Backfill)?);
        }
        Ok(outcomes)
    }

    fn run_locked(
        &self,
        logical_date: DateTime<Utc>,
        kind: RunKind,
    ) -> Result<RunOutcome, RunnerError> {
        let ctx = RunContext::build(&self.locator, &self.bucket, logical_date, kind)?;
        let span = tracing::info_span!(
            "run",
            dag_id = self.definition.dag_id(),
            run_id = ctx.run_id()
        );
        let _enter = span.enter();
        tracing::info!(logical_date = %logical_date, "run started");

        let started_at = Utc::now();
        let mut outputs = BTreeMap::new();
        let mut tasks = Vec::with_capacity(self.definition.tasks().len());
        let mut failed = false;

        for op in self.definition.tasks() {
            if failed {
                tasks.push(TaskRecord {
                    task_id: op.task_id().to_string(),
                    state: TaskState::UpstreamFailed,
                    attempts: 0,
                    error: None,
                });
                continue;
            }
            match self.run_task(op.as_ref(), &ctx, &outputs) {
                Ok((output, attempts)) => {
                    tasks.push(TaskRecord {
                        task_id: op.task_id().to_string(),
                        state: TaskState::Success,
                        attempts,
                        error: None,
                    });
                    outputs.insert(op.task_id().to_string(), output);
                }
                Err((err, attempts)) => {
                    tasks.push(TaskRecord {
                        task_id: op.task_id().to_string(),
                        state: TaskState::Failed,
                        attempts,
                        error: Some(err.to_string()),
                    });
                    failed = true;
                }
            }
        }

        let state = if failed { RunState::Failed } else { RunState::Success };
        let record = RunRecord {
            dag_id: self.definition.dag_id().to_string(),
            run_id: ctx.run_id().to_string(),
            kind,
            logical_date,
            state,
            started_at,
            finished_at: Utc::now(),
            tasks,
        };
        self.history.append(&record)?;

        match state {
            RunState::Success => tracing::info!("run succeeded"),
            RunState::Failed => tracing::error!("run failed"),
        }
        Ok(RunOutcome { record, outputs })
    }

    fn run_task(
        &self,
        op: &dyn Operator,
        run: &RunContext,
        upstream: &BTreeMap<String, TaskOutput>,
    ) -> Result<(TaskOutput, u32), (TaskError, u32)> {
        let mut attempt = 1;
        loop {
            tracing::info!(task_id = op.task_id(), attempt, "task started");
            let ctx = TaskContext {
                run,
                attempt,
                upstream,
            };
            match op.execute(&ctx) {
                Ok(output) => {
                    tracing::info!(task_id = op.task_id(), attempt, "task succeeded");
                    return Ok((output, attempt));
                }
                Err(err) if self.retry.should_retry(attempt, &err) => {
                    tracing::warn!(
                        task_id = op.task_id(),
                        attempt,
                        error = %err,
                        delay_secs = self.retry.delay.as_secs(),
                        "task failed, will retry"
                    );
                    self.raise(AlertKind::Retry, op.task_id(), run, attempt, &err);
                    thread::sleep(self.retry.delay);
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(task_id = op.task_id(), attempt, error = %err, "task failed");
                    self.raise(AlertKind::Failure, op.task_id(), run, attempt, &err);
                    return Err((err, attempt));
                }
            }
        }
    }

    fn raise(
        &self,
        kind: AlertKind,
        task_id: &str,
        run: &RunContext,
        attempt: u32,
        err: &TaskError,
    ) {
        if !self.alerts.wants(kind) {
            return;
        }
        let alert = Alert {
            kind,
            dag_id: self.definition.dag_id().to_string(),
            run_id: run.run_id().to_string(),
            task_id: task_id.to_string(),
            logical_date: run.logical_date(),
            attempt,
            error: err.to_string(),
            recipients: self.alerts.emails.clone(),
            raised_at: Utc::now(),
        };
        if let Err(e) = self.notifier.notify(&alert) {
            tracing::warn!(error = %e, "failed to deliver alert");
        }
    }
}
