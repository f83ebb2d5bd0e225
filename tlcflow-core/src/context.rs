//! Immutable per-run context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::locator::{validate_bucket_name, SourceLocator};
use crate::tabular::uncompressed_file_name;

/// Why a run was started. Only affects the run id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Scheduled,
    Backfill,
    Manual,
}

impl RunKind {
    fn prefix(self) -> &'static str {
        match self {
            RunKind::Scheduled => "scheduled",
            RunKind::Backfill => "backfill",
            RunKind::Manual => "manual",
        }
    }
}

/// Everything one run needs to know about where its data lives.
///
/// Built once per invocation and never mutated. The destination object key is
/// a pure function of (service, logical date).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    run_id: String,
    logical_date: DateTime<Utc>,
    service: String,
    source_url: String,
    source_object: String,
    destination_object: String,
    bucket: String,
}

impl RunContext {
    pub fn build(
        locator: &SourceLocator,
        bucket: &str,
        logical_date: DateTime<Utc>,
        kind: RunKind,
    ) -> Result<Self, ConfigError> {
        let bucket = validate_bucket_name(bucket)?;
        let location = locator.locate(logical_date)?;
        let destination_object = object_key(locator.service(), &location.file_name);

        Ok(Self {
            run_id: format!("{}__{}", kind.prefix(), logical_date.to_rfc3339()),
            logical_date,
            service: locator.service().to_string(),
            source_url: location.url,
            source_object: location.file_name,
            destination_object,
            bucket,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn logical_date(&self) -> DateTime<Utc> {
        self.logical_date
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Source file name, still compressed (`green_tripdata_2021-01.csv.gz`).
    pub fn source_object(&self) -> &str {
        &self.source_object
    }

    /// Destination key in the bucket (`green/green_tripdata_2021-01.csv`).
    pub fn destination_object(&self) -> &str {
        &self.destination_object
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Destination key: `{service}/{file name without compression suffix}`.
pub fn object_key(service: &str, source_file_name: &str) -> String {
    format!("{service}/{}", uncompressed_file_name(source_file_name))
}
