// ABOUTME: Core value types shared across the renderer: jobs, outcomes, modes
// ABOUTME: RenderJob is immutable per request; RenderOutcome is what every job resolves to

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What kind of artifact a job is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    Screenshot,
    Video,
}

impl RenderMode {
    /// File name the sandboxed script writes into its working directory.
    pub fn artifact_name(&self) -> &'static str {
        match self {
            RenderMode::Screenshot => "kivy_screenshot.png",
            RenderMode::Video => "kivy_video.mp4",
        }
    }
}

impl std::fmt::Display for RenderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderMode::Screenshot => write!(f, "screenshot"),
            RenderMode::Video => write!(f, "video"),
        }
    }
}

/// Where an explicit display-size hint was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HintSource {
    /// A direct window-size assignment in the snippet.
    Window,
    /// Framework configuration statements setting width/height.
    Config,
    /// No usable hint found.
    None,
}

/// One render request, created once and never mutated afterwards.
///
/// `job_id` is the external identifier supplied by the caller; it keys the
/// per-job scratch directory, so two attempts for the same id reuse (and
/// wipe) the same directory.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub job_id: String,
    pub source: String,
    pub mode: RenderMode,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub hint_source: HintSource,
    /// Outer deadline bounding total wall time, log collection included.
    pub deadline: Duration,
}

impl RenderJob {
    pub fn new(
        job_id: impl Into<String>,
        source: impl Into<String>,
        mode: RenderMode,
        deadline: Duration,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            source: source.into(),
            mode,
            width: None,
            height: None,
            hint_source: HintSource::None,
            deadline,
        }
    }

    pub fn with_size_hint(mut self, width: Option<u32>, height: Option<u32>, source: HintSource) -> Self {
        self.width = width;
        self.height = height;
        self.hint_source = source;
        self
    }

    /// Explicit sizing forces the cold path; pooled displays are fixed.
    pub fn has_size_hint(&self) -> bool {
        self.hint_source != HintSource::None && (self.width.is_some() || self.height.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failure,
    Timeout,
}

/// A captured output file, kept in memory until the caller stores it.
#[derive(Debug, Clone)]
pub struct RenderArtifact {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// What every job resolves to, regardless of which path it took or what
/// went wrong along the way.
#[derive(Debug, Clone, Serialize)]
pub struct RenderOutcome {
    pub status: OutcomeStatus,
    pub message: String,
    #[serde(skip_serializing)]
    pub artifact: Option<RenderArtifact>,
    pub log_lines: Vec<String>,
    /// Total wall time for the job, stamped by the orchestrator.
    pub duration: Duration,
    /// Size of the produced artifact, reported even when the data itself
    /// is withheld for exceeding the ceiling.
    pub artifact_size: Option<u64>,
}

impl RenderOutcome {
    pub fn success(artifact: RenderArtifact, log_lines: Vec<String>) -> Self {
        let size = artifact.bytes.len() as u64;
        Self {
            status: OutcomeStatus::Success,
            message: format!("rendered {}", artifact.file_name),
            artifact: Some(artifact),
            log_lines,
            duration: Duration::ZERO,
            artifact_size: Some(size),
        }
    }

    pub fn failure(message: impl Into<String>, log_lines: Vec<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            message: message.into(),
            artifact: None,
            log_lines,
            duration: Duration::ZERO,
            artifact_size: None,
        }
    }

    pub fn timeout(message: impl Into<String>, log_lines: Vec<String>) -> Self {
        Self {
            status: OutcomeStatus::Timeout,
            message: message.into(),
            artifact: None,
            log_lines,
            duration: Duration::ZERO,
            artifact_size: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}
