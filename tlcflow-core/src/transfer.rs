//! The transfer step: remote source to destination object.
//!
//! One call fetches the compressed monthly file, validates and re-encodes it
//! as plain CSV, and uploads it under a key derived from the run context.
//! Every intermediate file lives in a [`Workspace`] that is removed on every
//! exit path.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::context::RunContext;
use crate::fetch::{FetchError, SourceFetcher};
use crate::store::{ObjectStore, StoreError};
use crate::tabular::{normalize_csv, uncompressed_file_name, FormatError};
use crate::workspace::Workspace;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("malformed source data: {0}")]
    Format(#[from] FormatError),

    #[error("upload failed: {0}")]
    Upload(#[from] StoreError),

    #[error("workspace error: {0}")]
    Workspace(#[source] io::Error),
}

impl TransferError {
    /// Configuration problems fail fast; everything else is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransferError::Config(_))
    }
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Parent directory for scratch workspaces; the system temp dir when `None`.
    pub workspace_root: Option<PathBuf>,
    pub content_type: String,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            workspace_root: None,
            content_type: "text/csv".to_string(),
        }
    }
}

/// Outcome of one successful transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub bucket: String,
    pub object_key: String,
    pub source_url: String,
    /// Data rows, header excluded.
    pub rows: u64,
    pub columns: usize,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub content_hash: String,
}

pub struct TransferStep {
    fetcher: Arc<dyn SourceFetcher>,
    store: Arc<dyn ObjectStore>,
    options: TransferOptions,
}

impl TransferStep {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        store: Arc<dyn ObjectStore>,
        options: TransferOptions,
    ) -> Self {
        Self {
            fetcher,
            store,
            options,
        }
    }

    pub fn transfer(&self, ctx: &RunContext) -> Result<TransferReport, TransferError> {
        let span = tracing::info_span!(
            "transfer",
            run_id = ctx.run_id(),
            object = ctx.destination_object()
        );
        let _enter = span.enter();

        let workspace = Workspace::create(self.options.workspace_root.as_deref())
            .map_err(TransferError::Workspace)?;

        let compressed = workspace.file(ctx.source_object());
        let downloaded_bytes = {
            let file = File::create(&compressed).map_err(TransferError::Workspace)?;
            let mut sink = BufWriter::new(file);
            let n = self.fetcher.fetch_to(ctx.source_url(), &mut sink)?;
            sink.flush().map_err(TransferError::Workspace)?;
            n
        };
        tracing::info!(
            url = ctx.source_url(),
            bytes = downloaded_bytes,
            fetcher = self.fetcher.name(),
            "downloaded source"
        );

        // A plain source keeps its name, so the re-encoded copy needs another.
        let mut plain = workspace.file(&uncompressed_file_name(ctx.source_object()));
        if plain == compressed {
            plain = workspace.file(&format!("normalized-{}", ctx.source_object()));
        }
        let stats = normalize_csv(&compressed, &plain)?;
        tracing::debug!(rows = stats.rows, columns = stats.columns, "normalized source");

        let meta = self.store.put_file(
            ctx.bucket(),
            ctx.destination_object(),
            &plain,
            &self.options.content_type,
        )?;
        tracing::info!(
            bucket = %meta.bucket,
            key = %meta.key,
            bytes = meta.size,
            store = self.store.name(),
            "uploaded object"
        );

        let scratch = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            tracing::warn!(path = %scratch.display(), error = %e, "failed to remove workspace");
        }

        Ok(TransferReport {
            bucket: meta.bucket,
            object_key: meta.key,
            source_url: ctx.source_url().to_string(),
            rows: stats.rows,
            columns: stats.columns,
            downloaded_bytes,
            uploaded_bytes: meta.size,
            content_hash: meta.content_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_errors_are_final() {
        let config = TransferError::Config(ConfigError::EmptyService);
        assert!(!config.is_retryable());

        let fetch = TransferError::Fetch(FetchError::NotFound { url: "u".into() });
        assert!(fetch.is_retryable());

        let format = TransferError::Format(FormatError::MissingHeader {
            path: PathBuf::from("x.csv"),
        });
        assert!(format.is_retryable());
    }
}
