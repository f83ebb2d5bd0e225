//! Exclusive run lock.
//!
//! `{state_dir}/{dag_id}.lock` is created with `create_new`, so at most one
//! process runs a pipeline at a time. The file is removed when the lock drops.
//! A lock left by a killed process must be removed by hand; its contents name
//! the holder.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("pipeline already running (lock {path} held by {holder})")]
    AlreadyRunning { path: PathBuf, holder: String },

    #[error("lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

/// File-name-safe form of a pipeline id.
fn lock_file_name(dag_id: &str) -> String {
    let safe: String = dag_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{safe}.lock")
}

impl RunLock {
    pub fn acquire(state_dir: &Path, dag_id: &str) -> Result<Self, LockError> {
        let path = state_dir.join(lock_file_name(dag_id));
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(state_dir).map_err(io_err)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(LockError::AlreadyRunning { path, holder });
            }
            Err(e) => return Err(io_err(e)),
        };
        writeln!(file, "pid {} since {}", std::process::id(), Utc::now().to_rfc3339())
            .map_err(io_err)?;

        tracing::debug!(path = %path.display(), "acquired run lock");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}
