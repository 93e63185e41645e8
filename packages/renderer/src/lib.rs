// ABOUTME: Sandboxed Kivy snippet renderer: code inspection, a pre-warmed
// ABOUTME: container pool, per-job orchestration, and a metrics sink

pub mod engine;
pub mod inspector;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod runs;
pub mod script;
pub mod settings;
pub mod types;

pub use engine::{ContainerEngine, DockerEngine, EngineError, SandboxSpec};
pub use inspector::{CodeInspector, DisplayHint};
pub use metrics::{MetricsSnapshot, ResultSink};
pub use orchestrator::{ExecutionOrchestrator, SubmitError};
pub use pool::{SandboxHandle, SandboxPool};
pub use runs::RunWorkspace;
pub use script::ScriptAssembler;
pub use settings::RendererSettings;
pub use types::{
    HintSource, OutcomeStatus, RenderArtifact, RenderJob, RenderMode, RenderOutcome,
};
