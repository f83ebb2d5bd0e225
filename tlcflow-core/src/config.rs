//! Pipeline configuration.
//!
//! Every field has a default matching the monthly green-taxi pipeline, so an
//! empty TOML file (or no file at all) is a valid starting point. Deployment
//! values come from the environment and are layered on top:
//!
//! | variable               | field                      |
//! |------------------------|----------------------------|
//! | `GCP_PROJECT_ID`       | `warehouse.project_id`     |
//! | `GCP_GCS_BUCKET`       | `storage.bucket`           |
//! | `ALERT_EMAIL`          | `alert.email` (comma list) |
//! | `GCP_ACCESS_TOKEN`     | bearer token (not serialized) |
//! | `TLCFLOW_STORAGE_ROOT` | `storage.root`             |
//! | `TLCFLOW_STATE_DIR`    | `runtime.state_dir`        |

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::locator::{
    render_template, validate_bucket_name, SourceLocator, DEFAULT_DESTINATION_TEMPLATE,
    DEFAULT_ENDPOINT,
};
use crate::warehouse::TableRef;

/// Configuration errors. These fail fast, before any network or disk I/O,
/// and are never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting '{key}'")]
    MissingValue { key: String },

    #[error("service identifier must not be empty")]
    EmptyService,

    #[error("invalid bucket name '{bucket}': {reason}")]
    InvalidBucket { bucket: String, reason: String },

    #[error("malformed template '{template}': {reason}")]
    Template { template: String, reason: String },

    #[error("invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub source: SourceSection,
    pub storage: StorageSection,
    pub warehouse: WarehouseSection,
    pub retry: RetrySection,
    pub alert: AlertSection,
    pub runtime: RuntimeSection,

    /// Bearer token for Cloud Storage and BigQuery; environment only.
    #[serde(skip)]
    pub access_token: Option<String>,
}

/// DAG-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSection {
    pub dag_id: String,
    pub description: String,
    /// Service identifier: `green`, `yellow`, `fhv`.
    pub service: String,
    /// Warehouse dataset receiving the table.
    pub dataset: String,
    /// Five-field cron expression, monthly form only (`M H D * *`).
    pub schedule: String,
    pub start_date: NaiveDate,
    /// Run every missed interval since `start_date`, not only the latest.
    pub catchup: bool,
    pub max_active_runs: u32,
    pub tags: Vec<String>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            dag_id: "Load-Green-Taxi-Data-Web-To-GCS-To-BQ".into(),
            description:
                "Move trip data from the release site to Cloud Storage, then append it to BigQuery"
                    .into(),
            service: "green".into(),
            dataset: "alt_data".into(),
            schedule: "0 6 2 * *".into(),
            start_date: NaiveDate::from_ymd_opt(2019, 1, 1).unwrap_or_default(),
            catchup: true,
            max_active_runs: 1,
            tags: vec!["Website-to-GCS-Bucket-to-BQ".into()],
        }
    }
}

/// Remote source settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSection {
    pub endpoint: String,
    /// Destination file template; see [`crate::locator`] for placeholders.
    pub destination_path: String,
    pub timeout_secs: u64,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            destination_path: DEFAULT_DESTINATION_TEMPLATE.into(),
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Gcs,
    Local,
}

/// Destination object store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub backend: StorageBackend,
    /// Bucket name; `gs://` prefix and trailing separators are accepted.
    pub bucket: Option<String>,
    /// Root directory for the local backend.
    pub root: PathBuf,
    /// Override for the Cloud Storage endpoint (emulators, tests).
    pub base_url: Option<String>,
    pub content_type: String,
    pub timeout_secs: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Gcs,
            bucket: None,
            root: PathBuf::from("data/objects"),
            base_url: None,
            content_type: "text/csv".into(),
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseBackend {
    #[default]
    Bigquery,
    Local,
}

/// Warehouse loader settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WarehouseSection {
    pub backend: WarehouseBackend,
    pub project_id: Option<String>,
    /// Table name override; defaults to `{service}_{dataset}_table`.
    pub table: Option<String>,
    /// Root directory for the local backend.
    pub root: PathBuf,
    pub base_url: Option<String>,
    pub location: Option<String>,
    pub poll_interval_secs: u64,
    pub max_polls: u32,
}

impl Default for WarehouseSection {
    fn default() -> Self {
        Self {
            backend: WarehouseBackend::Bigquery,
            project_id: None,
            table: None,
            root: PathBuf::from("data/warehouse"),
            base_url: None,
            location: None,
            poll_interval_secs: 5,
            max_polls: 120,
        }
    }
}

/// Whole-task retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub retries: u32,
    pub delay_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            retries: 2,
            delay_secs: 60,
        }
    }
}

impl RetrySection {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Alerting policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AlertSection {
    pub email: Vec<String>,
    pub email_on_failure: bool,
    pub email_on_retry: bool,
    /// JSONL outbox picked up by a mail relay; alerts only go to the log when unset.
    pub outbox: Option<PathBuf>,
}

impl Default for AlertSection {
    fn default() -> Self {
        Self {
            email: Vec::new(),
            email_on_failure: true,
            email_on_retry: false,
            outbox: None,
        }
    }
}

/// Local state: run lock, run history, scratch workspaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSection {
    pub state_dir: PathBuf,
    /// Parent directory for scratch workspaces; the system temp dir when unset.
    pub workspace_root: Option<PathBuf>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            workspace_root: None,
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load from an optional file, overlay the process environment, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from an environment lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(project) = get("GCP_PROJECT_ID") {
            self.warehouse.project_id = Some(project);
        }
        if let Some(bucket) = get("GCP_GCS_BUCKET") {
            self.storage.bucket = Some(bucket);
        }
        if let Some(emails) = get("ALERT_EMAIL") {
            self.alert.email = emails
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(token) = get("GCP_ACCESS_TOKEN") {
            self.access_token = Some(token);
        }
        if let Some(root) = get("TLCFLOW_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(dir) = get("TLCFLOW_STATE_DIR") {
            self.runtime.state_dir = PathBuf::from(dir);
        }
    }

    /// Check everything that can be checked without I/O.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.dag_id.trim().is_empty() {
            return Err(ConfigError::MissingValue {
                key: "pipeline.dag_id".into(),
            });
        }
        if self.pipeline.dataset.trim().is_empty() {
            return Err(ConfigError::MissingValue {
                key: "pipeline.dataset".into(),
            });
        }
        if self.pipeline.max_active_runs != 1 {
            return Err(ConfigError::Invalid(format!(
                "max_active_runs must be 1, got {}",
                self.pipeline.max_active_runs
            )));
        }

        self.bucket()?;
        let locator = self.locator()?;
        let sample = self
            .pipeline
            .start_date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_default();
        locator.locate(sample)?;
        render_template(&self.source.endpoint, &self.pipeline.service, sample)?;

        if self.warehouse.backend == WarehouseBackend::Bigquery {
            self.project_id()?;
        }
        Ok(())
    }

    /// Normalized destination bucket.
    pub fn bucket(&self) -> Result<String, ConfigError> {
        let raw = self
            .storage
            .bucket
            .as_deref()
            .ok_or_else(|| ConfigError::MissingValue {
                key: "storage.bucket (GCP_GCS_BUCKET)".into(),
            })?;
        validate_bucket_name(raw)
    }

    pub fn project_id(&self) -> Result<&str, ConfigError> {
        self.warehouse
            .project_id
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingValue {
                key: "warehouse.project_id (GCP_PROJECT_ID)".into(),
            })
    }

    pub fn locator(&self) -> Result<SourceLocator, ConfigError> {
        SourceLocator::new(
            self.source.endpoint.clone(),
            self.pipeline.service.clone(),
            self.source.destination_path.clone(),
        )
    }

    /// Destination table: `{dataset}.{service}_{dataset}_table` unless overridden.
    pub fn table(&self) -> TableRef {
        let mut table = TableRef::for_service(
            self.warehouse.project_id.clone(),
            &self.pipeline.dataset,
            &self.pipeline.service,
        );
        if let Some(name) = &self.warehouse.table {
            table.table = name.clone();
        }
        table
    }
}
