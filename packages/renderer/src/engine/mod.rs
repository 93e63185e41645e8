// ABOUTME: Container engine abstraction driven by the pool and orchestrator
// ABOUTME: One production backend (Docker via bollard); swappable in tests

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerEngine;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Exec error: {0}")]
    Exec(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Everything needed to create and start one sandbox container. The same
/// struct describes warm pool members and disposable cold-path containers;
/// they differ only in command, mounts, and auto-remove.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env_vars: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub network_disabled: bool,
    pub auto_remove: bool,
    pub binds: Vec<BindMount>,
    /// Mount path -> mount options, e.g. "/tmp" -> "size=80m,noexec".
    pub tmpfs: HashMap<String, String>,
    pub ulimits: Vec<UlimitSpec>,
    pub no_new_privileges: bool,
}

#[derive(Debug, Clone)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone)]
pub struct UlimitSpec {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

/// Combined output of an exec or a log follow, forwarded chunk by chunk so
/// the consumer can apply its own deadline to collection.
pub struct OutputStream {
    pub receiver: tokio::sync::mpsc::UnboundedReceiver<OutputChunk>,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamType,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// The engine-daemon surface the renderer consumes. Exactly one daemon is
/// addressed per service instance.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Cheap daemon reachability check.
    async fn ping(&self) -> Result<()>;

    /// Create and start a container; returns the engine-assigned id.
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String>;

    /// Graceful stop with a grace period before the engine kills it.
    async fn stop_sandbox(&self, container_id: &str, timeout_secs: i64) -> Result<()>;

    /// Immediate kill. Succeeds if the container is already gone.
    async fn kill_sandbox(&self, container_id: &str) -> Result<()>;

    /// Remove a container. Succeeds if it is already gone.
    async fn remove_sandbox(&self, container_id: &str, force: bool) -> Result<()>;

    /// Ids of all containers (running or not) carrying every given label.
    async fn list_labeled(&self, labels: &HashMap<String, String>) -> Result<Vec<String>>;

    /// Unpack an in-memory tar archive into `dest_path` inside the container.
    async fn put_archive(&self, container_id: &str, dest_path: &str, archive: Vec<u8>)
        -> Result<()>;

    /// Read one file out of the container. `NotFound` when the path does
    /// not exist.
    async fn fetch_file(&self, container_id: &str, path: &str) -> Result<Vec<u8>>;

    /// Run a command in a running container, streaming combined output.
    /// The stream closes when the command finishes.
    async fn exec_streamed(
        &self,
        container_id: &str,
        command: Vec<String>,
        env: Vec<String>,
    ) -> Result<OutputStream>;

    /// Follow a container's own log output.
    async fn stream_logs(&self, container_id: &str, follow: bool) -> Result<OutputStream>;
}

/// Build an in-memory tar archive holding a single file at the archive root.
pub fn tar_single_file(file_name: &str, contents: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, file_name, contents)
        .map_err(|e| EngineError::Archive(format!("Failed to append {}: {}", file_name, e)))?;
    builder
        .into_inner()
        .map_err(|e| EngineError::Archive(format!("Failed to finalize archive: {}", e)))
}

/// Pull one file's bytes out of a tar archive by base name.
pub fn file_from_tar(archive: &[u8], file_name: &str) -> Result<Vec<u8>> {
    use std::io::Read;

    let mut ar = tar::Archive::new(archive);
    let entries = ar
        .entries()
        .map_err(|e| EngineError::Archive(format!("Failed to read archive: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| EngineError::Archive(format!("Failed to read entry: {}", e)))?;
        let is_match = entry
            .path()
            .map(|p| p.file_name() == Some(std::ffi::OsStr::new(file_name)))
            .unwrap_or(false);
        if is_match {
            let mut contents = Vec::new();
            entry
                .read_to_end(&mut contents)
                .map_err(|e| EngineError::Archive(format!("Failed to read {}: {}", file_name, e)))?;
            return Ok(contents);
        }
    }
    Err(EngineError::NotFound(format!(
        "{} not present in archive",
        file_name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tar_round_trip_preserves_contents() {
        let archive = tar_single_file("main.py", b"print('hello')").unwrap();
        let restored = file_from_tar(&archive, "main.py").unwrap();
        assert_eq!(restored, b"print('hello')");
    }

    #[test]
    fn test_file_from_tar_matches_by_base_name() {
        let archive = tar_single_file("kivy_screenshot.png", &[1, 2, 3]).unwrap();
        // Download archives often carry entries without directory prefixes,
        // but match on base name either way.
        assert_eq!(file_from_tar(&archive, "kivy_screenshot.png").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let archive = tar_single_file("main.py", b"x = 1").unwrap();
        match file_from_tar(&archive, "other.py") {
            Err(EngineError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|v| v.len())),
        }
    }
}
