//! Run history: JSONL append-only record of finished runs.
//!
//! One JSON object per line. Malformed lines (a torn write from a killed
//! process, a hand edit) are skipped on read, so one bad line never hides the
//! rest of the history.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tlcflow_core::RunKind;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode run record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Success,
    Failed,
    UpstreamFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub state: TaskState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub dag_id: String,
    pub run_id: String,
    pub kind: RunKind,
    pub logical_date: DateTime<Utc>,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks: Vec<TaskRecord>,
}

impl RunRecord {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Success
    }

    /// First failed task, if any.
    pub fn failed_task(&self) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.state == TaskState::Failed)
    }
}

pub struct RunHistory {
    path: PathBuf,
}

impl RunHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `{state_dir}/{dag_id}.history.jsonl`.
    pub fn for_pipeline(state_dir: &Path, dag_id: &str) -> Self {
        Self::new(state_dir.join(format!("{dag_id}.history.jsonl")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub fn append(&self, record: &RunRecord) -> Result<(), HistoryError> {
        let json = serde_json::to_string(record)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        writeln!(file, "{json}").map_err(|e| self.io_err(e))?;
        file.flush().map_err(|e| self.io_err(e))
    }

    /// All records, oldest first. Skips malformed lines.
    pub fn read_all(&self) -> Result<Vec<RunRecord>, HistoryError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path).map_err(|e| self.io_err(e))?;
        let mut records = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line.map_err(|e| self.io_err(e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::debug!(error = %e, "skipping malformed history line"),
            }
        }
        Ok(records)
    }

    /// The last `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<RunRecord>, HistoryError> {
        let mut records = self.read_all()?;
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    /// Logical dates with at least one successful run.
    pub fn succeeded_dates(&self) -> Result<BTreeSet<DateTime<Utc>>, HistoryError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(RunRecord::succeeded)
            .map(|r| r.logical_date)
            .collect())
    }
}
