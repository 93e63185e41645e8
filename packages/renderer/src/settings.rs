// ABOUTME: Renderer configuration tree with serde defaults and JSON file loading
// ABOUTME: Every timeout, resource ceiling, and security toggle lives here, never inline

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Top-level settings for the render service. Every field and section has a
/// default, so a partial JSON file (or none at all) yields a working
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererSettings {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub artifact: ArtifactSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    /// Root under which per-job scratch directories are created.
    #[serde(default = "default_runs_root")]
    pub runs_root: PathBuf,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            execution: ExecutionSettings::default(),
            limits: LimitSettings::default(),
            artifact: ArtifactSettings::default(),
            security: SecuritySettings::default(),
            runs_root: default_runs_root(),
        }
    }
}

impl RendererSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from a file when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

/// Warm-pool sizing and identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_pool_image")]
    pub image: String,
    #[serde(default = "default_pool_size")]
    pub size: usize,
    /// Wait after starting each container for its display service to come up.
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    /// Pause between sequential provisions.
    #[serde(default = "default_stagger_secs")]
    pub stagger_secs: u64,
    /// Label values identifying this service's containers; the sweep on
    /// initialize/drain targets exactly these.
    #[serde(default = "default_app_label")]
    pub app_label: String,
    #[serde(default = "default_role_label")]
    pub role_label: String,
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            image: default_pool_image(),
            size: default_pool_size(),
            settle_delay_secs: default_settle_delay_secs(),
            stagger_secs: default_stagger_secs(),
            app_label: default_app_label(),
            role_label: default_role_label(),
            container_prefix: default_container_prefix(),
        }
    }
}

impl PoolSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_secs(self.stagger_secs)
    }

    /// Identifying labels applied to every pool container.
    pub fn labels(&self) -> HashMap<String, String> {
        HashMap::from([
            (crate::pool::LABEL_APP.to_string(), self.app_label.clone()),
            (crate::pool::LABEL_ROLE.to_string(), self.role_label.clone()),
        ])
    }
}

/// Per-job execution parameters shared by the pooled and cold paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Image for disposable cold-path containers.
    #[serde(default = "default_cold_image")]
    pub cold_image: String,
    /// Interpreter invoked on the assembled script inside the sandbox.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// X display number the virtual display service listens on.
    #[serde(default = "default_display_number")]
    pub display_number: u32,
    #[serde(default = "default_width")]
    pub default_width: u32,
    #[serde(default = "default_height")]
    pub default_height: u32,
    /// How long a job waits for a warm handle before degrading to cold.
    #[serde(default = "default_lease_wait_ms")]
    pub lease_wait_ms: u64,
    /// In-sandbox command timeout; must stay below the outer timeout.
    #[serde(default = "default_inner_timeout_secs")]
    pub inner_timeout_secs: u64,
    /// Orchestrator-level deadline on execution and log collection.
    #[serde(default = "default_outer_timeout_secs")]
    pub outer_timeout_secs: u64,
    /// Bound on the archive copy into a warm handle.
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// Bound on artifact download out of a warm handle.
    #[serde(default = "default_extract_timeout_secs")]
    pub extract_timeout_secs: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            cold_image: default_cold_image(),
            interpreter: default_interpreter(),
            display_number: default_display_number(),
            default_width: default_width(),
            default_height: default_height(),
            lease_wait_ms: default_lease_wait_ms(),
            inner_timeout_secs: default_inner_timeout_secs(),
            outer_timeout_secs: default_outer_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            extract_timeout_secs: default_extract_timeout_secs(),
        }
    }
}

impl ExecutionSettings {
    pub fn lease_wait(&self) -> Duration {
        Duration::from_millis(self.lease_wait_ms)
    }

    pub fn inner_timeout(&self) -> Duration {
        Duration::from_secs(self.inner_timeout_secs)
    }

    pub fn outer_timeout(&self) -> Duration {
        Duration::from_secs(self.outer_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    /// Environment for interpreter runs. Output must stay unbuffered so a
    /// force-killed process does not take its last log lines with it.
    pub fn execution_env(&self) -> Vec<String> {
        vec![
            format!("DISPLAY=:{}", self.display_number),
            "PYTHONUNBUFFERED=1".to_string(),
        ]
    }

    /// The same pairs shaped for a container spec.
    pub fn env_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("DISPLAY".to_string(), format!(":{}", self.display_number)),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ])
    }
}

/// Resource ceilings applied to every sandbox container, warm or cold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: i64,
    /// CPU quota per 100ms period; 50000 is half a core.
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: i64,
    #[serde(default = "default_network_disabled")]
    pub network_disabled: bool,
    /// Mount options for the tmpfs at /tmp.
    #[serde(default = "default_tmpfs_options")]
    pub tmpfs_options: String,
    /// Largest file a sandboxed process may create, in bytes.
    #[serde(default = "default_fsize_limit")]
    pub fsize_limit: i64,
    #[serde(default = "default_nofile_limit")]
    pub nofile_limit: i64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            memory_bytes: default_memory_bytes(),
            cpu_quota: default_cpu_quota(),
            network_disabled: default_network_disabled(),
            tmpfs_options: default_tmpfs_options(),
            fsize_limit: default_fsize_limit(),
            nofile_limit: default_nofile_limit(),
        }
    }
}

impl LimitSettings {
    pub fn tmpfs_map(&self) -> HashMap<String, String> {
        HashMap::from([("/tmp".to_string(), self.tmpfs_options.clone())])
    }

    pub fn ulimit_specs(&self) -> Vec<crate::engine::UlimitSpec> {
        vec![
            crate::engine::UlimitSpec {
                name: "fsize".to_string(),
                soft: self.fsize_limit,
                hard: self.fsize_limit,
            },
            crate::engine::UlimitSpec {
                name: "nofile".to_string(),
                soft: self.nofile_limit,
                hard: self.nofile_limit,
            },
        ]
    }
}

/// Artifact acceptance rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSettings {
    /// Artifacts above this size are reported but never returned.
    #[serde(default = "default_artifact_max_bytes")]
    pub max_bytes: u64,
    /// How many trailing log lines accompany a failed or timed-out job.
    #[serde(default = "default_log_tail")]
    pub log_tail: usize,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            max_bytes: default_artifact_max_bytes(),
            log_tail: default_log_tail(),
        }
    }
}

/// Static-analysis rejection and in-sandbox process hygiene.
///
/// With `reject_dangerous` off, nothing at this layer blocks imports or
/// file access; isolation then rests entirely on the container's resource
/// and network controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default = "default_reject_dangerous")]
    pub reject_dangerous: bool,
    /// Command-line patterns (anchored regexes) that are allowed to survive
    /// the post-job orphan sweep inside a warm container. Tied to the
    /// sandbox image's entrypoint, which is why it is configuration.
    #[serde(default = "default_baseline_processes")]
    pub baseline_processes: Vec<String>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            reject_dangerous: default_reject_dangerous(),
            baseline_processes: default_baseline_processes(),
        }
    }
}

fn default_runs_root() -> PathBuf {
    PathBuf::from("runs")
}

fn default_pool_image() -> String {
    "kivy-renderer:prewarmed".to_string()
}

fn default_pool_size() -> usize {
    2
}

fn default_settle_delay_secs() -> u64 {
    5
}

fn default_stagger_secs() -> u64 {
    1
}

fn default_app_label() -> String {
    "vitrine".to_string()
}

fn default_role_label() -> String {
    "render-pool".to_string()
}

fn default_container_prefix() -> String {
    "vitrine".to_string()
}

fn default_cold_image() -> String {
    "kivy-renderer:latest".to_string()
}

fn default_interpreter() -> String {
    "/app/.venv/bin/python".to_string()
}

fn default_display_number() -> u32 {
    99
}

fn default_width() -> u32 {
    800
}

fn default_height() -> u32 {
    600
}

fn default_lease_wait_ms() -> u64 {
    1000
}

fn default_inner_timeout_secs() -> u64 {
    25
}

fn default_outer_timeout_secs() -> u64 {
    30
}

fn default_transfer_timeout_secs() -> u64 {
    15
}

fn default_extract_timeout_secs() -> u64 {
    15
}

fn default_memory_bytes() -> i64 {
    512 * 1024 * 1024
}

fn default_cpu_quota() -> i64 {
    50_000
}

fn default_network_disabled() -> bool {
    true
}

fn default_tmpfs_options() -> String {
    "size=80m,noexec,nosuid,nodev".to_string()
}

fn default_fsize_limit() -> i64 {
    104_857_600
}

fn default_nofile_limit() -> i64 {
    100
}

fn default_artifact_max_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_log_tail() -> usize {
    50
}

fn default_reject_dangerous() -> bool {
    true
}

fn default_baseline_processes() -> Vec<String> {
    vec![
        "/bin/sh -c Xvfb.*".to_string(),
        "Xvfb :99 -screen 0 800x600x24 -nolisten tcp.*".to_string(),
        "tail -f /dev/null".to_string(),
        "/bin/bash".to_string(),
        "sleep 30".to_string(),
    ]
}
