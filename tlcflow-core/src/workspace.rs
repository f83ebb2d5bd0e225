//! Scoped scratch workspace.
//!
//! A [`Workspace`] owns a freshly created directory and removes it when
//! dropped, so every exit path (success, `?` propagation, unwinding) reclaims
//! the downloaded and re-encoded files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Prefix shared by every workspace directory.
pub const WORKSPACE_PREFIX: &str = "tlcflow-";

#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh workspace under `root`, or the system temp dir.
    pub fn create(root: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);
        let dir = match root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path for a file inside the workspace. Only the final component of
    /// `name` is used, so a name can never escape the directory.
    pub fn file(&self, name: &str) -> PathBuf {
        let base = Path::new(name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("artifact"));
        self.dir.path().join(base)
    }

    /// Remove the workspace now, surfacing any removal error.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }

    /// Remove workspaces left behind by killed processes.
    ///
    /// Only call while holding the pipeline's run lock: a live run's workspace
    /// lives under the same root.
    pub fn sweep_stale(root: &Path) -> io::Result<usize> {
        if !root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name();
            let is_workspace = name
                .to_str()
                .map(|n| n.starts_with(WORKSPACE_PREFIX))
                .unwrap_or(false);
            if is_workspace && entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ws = Workspace::create(Some(root.path())).unwrap();
            fs::write(ws.file("a.csv"), "x").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn removed_on_early_return() {
        fn failing(root: &Path) -> io::Result<()> {
            let ws = Workspace::create(Some(root))?;
            fs::write(ws.file("partial.csv.gz"), "half")?;
            Err(io::Error::new(io::ErrorKind::Other, "boom"))
        }

        let root = tempfile::tempdir().unwrap();
        assert!(failing(root.path()).is_err());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn file_names_cannot_escape() {
        let ws = Workspace::create(None).unwrap();
        let p = ws.file("../../etc/passwd");
        assert_eq!(p.parent().unwrap(), ws.path());
        assert!(p.ends_with("passwd"));
    }

    #[test]
    fn sweeps_only_workspace_dirs() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("tlcflow-abc")).unwrap();
        fs::write(root.path().join("tlcflow-abc").join("f"), "x").unwrap();
        fs::create_dir(root.path().join("keep-me")).unwrap();

        let removed = Workspace::sweep_stale(root.path()).unwrap();
        assert_eq!(removed, 1);
        assert!(root.path().join("keep-me").exists());
        assert!(!root.path().join("tlcflow-abc").exists());
    }
}
