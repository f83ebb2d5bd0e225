//! Warehouse loaders.
//!
//! A loader appends the rows of one or more stored objects to a table with a
//! fixed schema. [`LocalWarehouse`] keeps tables as CSV files on disk and is
//! used for local runs and tests; [`BigQueryLoader`] submits load jobs.

pub mod bigquery;
pub mod local;
pub mod schema;

pub use bigquery::BigQueryLoader;
pub use local::LocalWarehouse;
pub use schema::{FieldMode, FieldType, SchemaField, TableSchema};

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Fully qualified destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub project: Option<String>,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    /// `{dataset}.{service}_{dataset}_table`.
    pub fn for_service(project: Option<String>, dataset: &str, service: &str) -> Self {
        Self {
            project,
            dataset: dataset.to_string(),
            table: format!("{service}_{dataset}_table"),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project {
            Some(project) => write!(f, "{project}.{}.{}", self.dataset, self.table),
            None => write!(f, "{}.{}", self.dataset, self.table),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    #[default]
    Append,
    Truncate,
    /// Only load into an empty table.
    Empty,
}

impl WriteDisposition {
    pub fn as_bigquery(self) -> &'static str {
        match self {
            WriteDisposition::Append => "WRITE_APPEND",
            WriteDisposition::Truncate => "WRITE_TRUNCATE",
            WriteDisposition::Empty => "WRITE_EMPTY",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub bucket: String,
    pub source_objects: Vec<String>,
    pub destination: TableRef,
    pub schema: TableSchema,
    pub write_disposition: WriteDisposition,
    pub skip_leading_rows: u32,
}

impl LoadRequest {
    /// Append one CSV object with a header row.
    pub fn append_csv(
        bucket: impl Into<String>,
        object: impl Into<String>,
        destination: TableRef,
        schema: TableSchema,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            source_objects: vec![object.into()],
            destination,
            schema,
            write_disposition: WriteDisposition::Append,
            skip_leading_rows: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub destination: String,
    pub rows_loaded: u64,
    pub job_id: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("source object missing: {bucket}/{key}")]
    SourceMissing { bucket: String, key: String },

    #[error("object store: {0}")]
    Store(#[from] StoreError),

    #[error("{object} line {line}: expected {expected} columns, found {found}")]
    ColumnCount {
        object: String,
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("{object} line {line}: column '{column}' expects {expected}, got '{value}'")]
    InvalidValue {
        object: String,
        line: u64,
        column: String,
        expected: &'static str,
        value: String,
    },

    #[error("{object} line {line}: required column '{column}' is empty")]
    NullInRequired {
        object: String,
        line: u64,
        column: String,
    },

    #[error("{object}: {source}")]
    Format {
        object: String,
        #[source]
        source: csv::Error,
    },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("table {table} is not empty")]
    TableNotEmpty { table: String },

    #[error("destination table has no project id")]
    MissingProject,

    #[error("load job rejected (HTTP {status}): {detail}")]
    JobRejected { status: u16, detail: String },

    #[error("load job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("load job {job_id} still running after {polls} polls")]
    JobTimeout { job_id: String, polls: u32 },

    #[error("network failure talking to warehouse: {0}")]
    Network(#[source] reqwest::Error),

    #[error("unexpected warehouse response: {0}")]
    Response(String),
}

/// Appends stored objects into a warehouse table.
pub trait WarehouseLoader: Send + Sync {
    /// Human-readable name of this loader.
    fn name(&self) -> &str;

    fn load(&self, request: &LoadRequest) -> Result<LoadReport, LoadError>;
}
