//! CSV-file warehouse.
//!
//! Each table is `{root}/{dataset}/{table}.csv`. A load validates every row of
//! every source object before touching the table, then rewrites the table via
//! a temporary sibling and a rename.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use csv::StringRecord;

use super::{LoadError, LoadReport, LoadRequest, TableRef, WarehouseLoader, WriteDisposition};
use crate::store::{ObjectStore, StoreError};

pub struct LocalWarehouse {
    root: PathBuf,
    store: Arc<dyn ObjectStore>,
}

impl LocalWarehouse {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            root: root.into(),
            store,
        }
    }

    pub fn table_path(&self, table: &TableRef) -> PathBuf {
        self.root
            .join(&table.dataset)
            .join(format!("{}.csv", table.table))
    }

    /// Data rows currently in `table`; zero when it does not exist yet.
    pub fn row_count(&self, table: &TableRef) -> Result<u64, LoadError> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok(0);
        }
        let file = File::open(&path).map_err(|e| io_err(&path, e))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(BufReader::new(file));
        let mut rows = 0u64;
        for record in reader.records() {
            record.map_err(|source| LoadError::Format {
                object: path.display().to_string(),
                source,
            })?;
            rows += 1;
        }
        Ok(rows)
    }

    /// Fetch and validate one object, returning its data rows.
    fn read_object(
        &self,
        request: &LoadRequest,
        key: &str,
    ) -> Result<Vec<StringRecord>, LoadError> {
        let bytes = match self.store.get(&request.bucket, key) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound { bucket, key }) => {
                return Err(LoadError::SourceMissing { bucket, key })
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes.as_slice());
        let mut rows = Vec::new();
        for (idx, result) in reader.records().enumerate() {
            let record = result.map_err(|source| LoadError::Format {
                object: key.to_string(),
                source,
            })?;
            let line = idx as u64 + 1;
            if line <= u64::from(request.skip_leading_rows) {
                continue;
            }
            request.schema.validate_record(key, line, &record)?;
            rows.push(record);
        }
        Ok(rows)
    }
}

fn io_err(path: &Path, source: std::io::Error) -> LoadError {
    LoadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl WarehouseLoader for LocalWarehouse {
    fn name(&self) -> &str {
        "local"
    }

    fn load(&self, request: &LoadRequest) -> Result<LoadReport, LoadError> {
        let mut batch = Vec::new();
        for key in &request.source_objects {
            batch.extend(self.read_object(request, key)?);
        }

        let path = self.table_path(&request.destination);
        let existing = path.exists();
        if request.write_disposition == WriteDisposition::Empty
            && self.row_count(&request.destination)? > 0
        {
            return Err(LoadError::TableNotEmpty {
                table: request.destination.to_string(),
            });
        }
        let keep_existing = existing && request.write_disposition == WriteDisposition::Append;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let tmp = path.with_extension("csv.tmp");
        let result = write_table(&path, &tmp, keep_existing, request, &batch);
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result?;

        let rows_loaded = batch.len() as u64;
        tracing::info!(
            table = %request.destination,
            rows = rows_loaded,
            objects = request.source_objects.len(),
            "loaded rows into local table"
        );
        Ok(LoadReport {
            destination: request.destination.to_string(),
            rows_loaded,
            job_id: format!("local_{}", Utc::now().format("%Y%m%dT%H%M%S%.6f")),
        })
    }
}

fn write_table(
    path: &Path,
    tmp: &Path,
    keep_existing: bool,
    request: &LoadRequest,
    batch: &[StringRecord],
) -> Result<(), LoadError> {
    if keep_existing {
        fs::copy(path, tmp).map_err(|e| io_err(tmp, e))?;
    } else {
        File::create(tmp).map_err(|e| io_err(tmp, e))?;
    }

    let file = OpenOptions::new()
        .append(true)
        .open(tmp)
        .map_err(|e| io_err(tmp, e))?;
    let mut wtr = csv::Writer::from_writer(BufWriter::new(file));
    let csv_err = |e: csv::Error| LoadError::Format {
        object: tmp.display().to_string(),
        source: e,
    };
    if !keep_existing {
        wtr.write_record(request.schema.column_names())
            .map_err(csv_err)?;
    }
    for record in batch {
        wtr.write_record(record).map_err(csv_err)?;
    }
    wtr.flush().map_err(|e| io_err(tmp, e))?;
    drop(wtr);

    fs::rename(tmp, path).map_err(|e| io_err(path, e))
}
