//! tlcflow core: everything one monthly trip-data run touches.
//!
//! This crate contains the data path of the pipeline:
//! - Source locator (URL and object-name templates, bucket/path normalization)
//! - Immutable run context derived from (service, logical date)
//! - Scoped scratch workspace with guaranteed cleanup
//! - Source fetcher (blocking HTTP)
//! - Delimited-text codec (gzip detection, structural validation, re-encoding)
//! - Object stores (local filesystem, Google Cloud Storage)
//! - Warehouse schema and loaders (local append table, BigQuery load jobs)
//! - The transfer step tying fetch, normalize and upload together
//! - Layered configuration (TOML file + environment)

pub mod config;
pub mod context;
pub mod fetch;
pub mod locator;
pub mod store;
pub mod tabular;
pub mod transfer;
pub mod warehouse;
pub mod workspace;

pub use config::{ConfigError, PipelineConfig};
pub use context::{RunContext, RunKind};
pub use fetch::{FetchError, HttpFetcher, SourceFetcher};
pub use locator::{
    normalize_bucket_name, normalize_destination_path, SourceLocation, SourceLocator,
};
pub use store::{GcsObjectStore, LocalObjectStore, ObjectMeta, ObjectStore, StoreError};
pub use tabular::{Compression, FormatError, NormalizeStats, Table};
pub use transfer::{TransferError, TransferOptions, TransferReport, TransferStep};
pub use warehouse::{
    BigQueryLoader, LoadError, LoadReport, LoadRequest, LocalWarehouse, TableRef, TableSchema,
    WarehouseLoader, WriteDisposition,
};
pub use workspace::Workspace;
