// ABOUTME: Per-job scratch directories under the configured runs root
// ABOUTME: Each job id maps to one directory, recreated empty on every attempt

use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Owns the on-disk layout `<root>/<job_id>/`. The cold path bind-mounts a
/// job's directory into its container, so `prepare` returns an absolute
/// path.
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    root: PathBuf,
}

impl RunWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Recreate the job's directory empty and return its absolute path.
    /// A repeat attempt for the same id wipes whatever the previous one
    /// left behind.
    pub fn prepare(&self, job_id: &str) -> io::Result<PathBuf> {
        let dir = self.root.join(sanitize_job_id(job_id));
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        let absolute = std::fs::canonicalize(&dir)?;
        debug!(job_id, path = %absolute.display(), "prepared run directory");
        Ok(absolute)
    }

    pub fn remove(&self, job_id: &str) -> io::Result<()> {
        let dir = self.root.join(sanitize_job_id(job_id));
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Job ids come from the caller; they become path components, so anything
/// outside a conservative character set is replaced.
fn sanitize_job_id(job_id: &str) -> String {
    let cleaned: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}
