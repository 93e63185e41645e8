// ABOUTME: Per-job render driver: pooled vs cold path, bounded timeouts, artifact
// ABOUTME: extraction with size ceiling, orphan cleanup, and metrics discipline

use crate::engine::{self, tar_single_file, BindMount, ContainerEngine, EngineError, OutputStream, SandboxSpec};
use crate::inspector::CodeInspector;
use crate::metrics::ResultSink;
use crate::pool::{SandboxHandle, SandboxPool, LABEL_APP, LABEL_ROLE};
use crate::runs::RunWorkspace;
use crate::script::ScriptAssembler;
use crate::settings::{ExecutionSettings, RendererSettings, SecuritySettings};
use crate::types::{RenderArtifact, RenderJob, RenderMode, RenderOutcome};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Role label distinguishing disposable cold-path containers from pool
/// members, so the pool sweep never touches a job in flight.
const COLD_ROLE: &str = "cold-render";

/// Ceiling on housekeeping execs (working-directory reset, orphan sweep);
/// each call is further clamped to the job's remaining deadline.
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum budget for the stray-process sweep, which must still run when
/// the outer deadline is already spent.
const STRAY_KILL_GRACE: Duration = Duration::from_secs(5);

/// Pre-job rejection. Raised before a RenderJob exists, so it is never
/// counted as an attempt.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("No renderable snippet found in the submitted text")]
    NoRenderableSnippet,

    #[error("Snippet rejected by rule: {0}")]
    Rejected(&'static str),
}

#[derive(Debug, Error)]
enum JobError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Scratch directory error: {0}")]
    Scratch(#[from] std::io::Error),
}

struct CollectedOutput {
    lines: Vec<String>,
    timed_out: bool,
}

/// Drives one render job end to end. Holds the pool, metrics sink, and
/// inspector by reference; owns no per-job state, so one instance serves
/// concurrent jobs.
pub struct ExecutionOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    pool: Arc<SandboxPool>,
    metrics: Arc<ResultSink>,
    inspector: CodeInspector,
    runs: RunWorkspace,
    settings: Arc<RendererSettings>,
}

impl ExecutionOrchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        pool: Arc<SandboxPool>,
        metrics: Arc<ResultSink>,
        settings: Arc<RendererSettings>,
    ) -> Self {
        Self {
            inspector: CodeInspector::new(&settings.security),
            runs: RunWorkspace::new(settings.runs_root.clone()),
            engine,
            pool,
            metrics,
            settings,
        }
    }

    /// Entry point for callers holding raw text (a chat message, a file).
    /// Inspection failures reject the submission before any job exists.
    pub async fn submit(&self, raw_text: &str, mode: RenderMode) -> Result<RenderOutcome, SubmitError> {
        let snippet = self
            .inspector
            .select_renderable(raw_text)
            .ok_or(SubmitError::NoRenderableSnippet)?;

        if let Some(pattern) = self.inspector.scan_danger(&snippet) {
            info!(pattern, "Submission rejected by danger rule");
            return Err(SubmitError::Rejected(pattern));
        }

        let hint = self.inspector.parse_display_hint(&snippet);
        let job = RenderJob::new(
            Uuid::new_v4().to_string(),
            snippet,
            mode,
            self.settings.execution.outer_timeout(),
        )
        .with_size_hint(hint.width, hint.height, hint.source);

        Ok(self.execute(&job).await)
    }

    /// Run one job. Infallible by design: every engine fault, timeout, and
    /// artifact problem is converted into a RenderOutcome, and the metrics
    /// discipline holds on every branch (one attempt, one success-or-
    /// failure, one duration observation).
    pub async fn execute(&self, job: &RenderJob) -> RenderOutcome {
        let started = Instant::now();
        self.metrics.record_attempt().await;

        let mut outcome = self.run_job(job, started).await;
        outcome.duration = started.elapsed();

        if outcome.is_success() {
            self.metrics.record_success().await;
            if let Some(size) = outcome.artifact_size {
                self.metrics.observe_artifact_bytes(size).await;
            }
        } else {
            self.metrics.record_failure().await;
        }
        self.metrics.observe_duration(outcome.duration).await;

        info!(
            job_id = %job.job_id,
            status = ?outcome.status,
            duration_ms = outcome.duration.as_millis() as u64,
            "Render job finished"
        );
        outcome
    }

    async fn run_job(&self, job: &RenderJob, started: Instant) -> RenderOutcome {
        if job.has_size_hint() {
            debug!(
                job_id = %job.job_id,
                width = ?job.width,
                height = ?job.height,
                source = ?job.hint_source,
                "Explicit size hint; pooled displays are fixed, using cold path"
            );
            return self.run_cold(job, started).await;
        }

        if let Some(handle) = self.pool.lease().await {
            let result = self.run_pooled(&handle, job, started).await;
            // Release before inspecting the result so the handle recycles
            // on every branch, errors included.
            self.pool.release(handle).await;
            match result {
                Ok(outcome) => return outcome,
                Err(e) => {
                    warn!(
                        job_id = %job.job_id,
                        error = %e,
                        "Pooled path failed; falling back to cold path"
                    );
                }
            }
        } else {
            debug!(job_id = %job.job_id, "No pool container available; using cold path");
        }

        self.run_cold(job, started).await
    }

    /// Render inside a leased warm container. Errors bubble to the caller
    /// for the single pooled-to-cold fallback; Timeout and artifact
    /// problems are final outcomes, not errors.
    async fn run_pooled(
        &self,
        handle: &SandboxHandle,
        job: &RenderJob,
        started: Instant,
    ) -> engine::Result<RenderOutcome> {
        let exec = &self.settings.execution;

        self.reset_workdir(handle, housekeeping_bound(job, started))
            .await?;

        let script = ScriptAssembler::compose(job.mode, &job.source);
        let archive = tar_single_file("main.py", script.as_bytes())?;
        let transfer_bound = exec.transfer_timeout().min(remaining(job, started));
        timeout(
            transfer_bound,
            self.engine
                .put_archive(&handle.container_id, "/work", archive),
        )
        .await
        .map_err(|_| EngineError::Archive("Script transfer timed out".to_string()))??;

        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!(
                "cd /work && timeout {}s {} main.py",
                exec.inner_timeout_secs, exec.interpreter
            ),
        ];
        let stream = self
            .engine
            .exec_streamed(&handle.container_id, command, exec.execution_env())
            .await?;

        let collected = self.collect_stream(stream, remaining(job, started)).await;
        let log_tail = self.settings.artifact.log_tail;
        if collected.timed_out {
            warn!(
                job_id = %job.job_id,
                container = %handle.name,
                "Outer timeout elapsed; force-killing in-flight work"
            );
            // The warm container must survive for recycling, so the kill
            // targets the processes inside it, not the container.
            self.kill_strays(handle, sweep_bound(job, started)).await;
            return Ok(RenderOutcome::timeout(
                format!("Render timed out after {}s", job.deadline.as_secs()),
                tail(&collected.lines, log_tail),
            ));
        }

        let artifact_path = format!("/work/{}", job.mode.artifact_name());
        let fetched = timeout(
            exec.extract_timeout(),
            self.engine.fetch_file(&handle.container_id, &artifact_path),
        )
        .await
        .map_err(|_| EngineError::Archive("Artifact extraction timed out".to_string()))?;

        let outcome = match fetched {
            Ok(bytes) => self.accept_artifact(job, bytes, &collected.lines),
            Err(EngineError::NotFound(_)) => RenderOutcome::failure(
                "No artifact was produced; the app may have exited before drawing",
                tail(&collected.lines, log_tail),
            ),
            Err(other) => return Err(other),
        };

        if outcome.is_success() {
            // Leaked user processes must not survive into the next lease.
            self.kill_strays(handle, sweep_bound(job, started)).await;
        }

        Ok(outcome)
    }

    async fn run_cold(&self, job: &RenderJob, started: Instant) -> RenderOutcome {
        match self.try_cold(job, started).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Cold path failed");
                RenderOutcome::failure(format!("Sandbox execution failed: {}", e), Vec::new())
            }
        }
    }

    /// Provision one disposable container sized to the job, with the job's
    /// scratch directory mounted instead of archive transfer. Auto-remove
    /// tears it down on exit.
    async fn try_cold(&self, job: &RenderJob, started: Instant) -> Result<RenderOutcome, JobError> {
        let exec = &self.settings.execution;
        let width = job.width.unwrap_or(exec.default_width);
        let height = job.height.unwrap_or(exec.default_height);

        let run_dir = self.runs.prepare(&job.job_id)?;
        let script = ScriptAssembler::compose(job.mode, &job.source);
        std::fs::write(run_dir.join("main.py"), script).map_err(JobError::Scratch)?;

        let spec = self.cold_spec(job, &run_dir, width, height);
        let container_name = spec.name.clone();
        let container_id = self.engine.create_sandbox(&spec).await?;

        let stream = self.engine.stream_logs(&container_id, true).await?;
        let collected = self.collect_stream(stream, remaining(job, started)).await;
        let log_tail = self.settings.artifact.log_tail;

        if collected.timed_out {
            warn!(
                job_id = %job.job_id,
                container = %container_name,
                "Outer timeout elapsed; killing cold container"
            );
            if let Err(e) = self.engine.kill_sandbox(&container_id).await {
                warn!(container = %container_name, error = %e, "Failed to kill timed-out container");
            }
            return Ok(RenderOutcome::timeout(
                format!("Render timed out after {}s", job.deadline.as_secs()),
                tail(&collected.lines, log_tail),
            ));
        }

        let artifact_file = run_dir.join(job.mode.artifact_name());
        let outcome = if artifact_file.exists() {
            let bytes = std::fs::read(&artifact_file).map_err(JobError::Scratch)?;
            self.accept_artifact(job, bytes, &collected.lines)
        } else {
            RenderOutcome::failure(
                "No artifact was produced; the app may have exited before drawing",
                tail(&collected.lines, log_tail),
            )
        };
        Ok(outcome)
    }

    /// Enforce the size ceiling. Oversized artifacts are reported but the
    /// data is withheld, never returned to the caller.
    fn accept_artifact(&self, job: &RenderJob, bytes: Vec<u8>, lines: &[String]) -> RenderOutcome {
        let size = bytes.len() as u64;
        let ceiling = self.settings.artifact.max_bytes;
        let log_tail = self.settings.artifact.log_tail;

        if size > ceiling {
            warn!(
                job_id = %job.job_id,
                size,
                ceiling,
                "Artifact exceeds size ceiling; withholding data"
            );
            let mut outcome = RenderOutcome::failure(
                format!(
                    "Artifact is too large ({} bytes), possibly malicious; it was withheld",
                    size
                ),
                tail(lines, log_tail),
            );
            outcome.artifact_size = Some(size);
            return outcome;
        }

        RenderOutcome::success(
            RenderArtifact {
                file_name: job.mode.artifact_name().to_string(),
                bytes,
            },
            tail(lines, log_tail),
        )
    }

    /// Delete and recreate /work so nothing from a prior lease leaks into
    /// this job.
    async fn reset_workdir(&self, handle: &SandboxHandle, bound: Duration) -> engine::Result<()> {
        let stream = self
            .engine
            .exec_streamed(
                &handle.container_id,
                vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "rm -rf /work && mkdir -p /work".to_string(),
                ],
                Vec::new(),
            )
            .await?;
        let collected = self.collect_stream(stream, bound).await;
        if collected.timed_out {
            return Err(EngineError::Exec(
                "Working directory reset timed out".to_string(),
            ));
        }
        Ok(())
    }

    /// Kill everything in the container whose command line matches no
    /// baseline-allowlist entry. Best effort: failures are logged and
    /// swallowed, never escalated to the job.
    async fn kill_strays(&self, handle: &SandboxHandle, bound: Duration) {
        let script = stray_kill_script(&self.settings.security);
        match self
            .engine
            .exec_streamed(
                &handle.container_id,
                vec!["/bin/sh".to_string(), "-c".to_string(), script],
                Vec::new(),
            )
            .await
        {
            Ok(stream) => {
                let collected = self.collect_stream(stream, bound).await;
                for line in &collected.lines {
                    debug!(container = %handle.name, "{}", line);
                }
            }
            Err(e) => {
                warn!(container = %handle.name, error = %e, "Orphan process cleanup failed");
            }
        }
    }

    /// Gather chunks into lines until the stream closes or the deadline
    /// elapses. The unconsumed remainder stays with the producer task,
    /// which stops on its own once the channel is dropped.
    async fn collect_stream(&self, mut stream: OutputStream, deadline: Duration) -> CollectedOutput {
        let mut lines = Vec::new();
        let mut buffer = String::new();
        let started = Instant::now();

        let timed_out = loop {
            let left = match deadline.checked_sub(started.elapsed()) {
                Some(left) if !left.is_zero() => left,
                _ => break true,
            };
            match timeout(left, stream.receiver.recv()).await {
                Ok(Some(chunk)) => {
                    buffer.push_str(&chunk.text());
                    while let Some(pos) = buffer.find('\n') {
                        let line: String = buffer.drain(..=pos).collect();
                        lines.push(line.trim_end().to_string());
                    }
                }
                Ok(None) => break false,
                Err(_) => break true,
            }
        };

        if !buffer.is_empty() {
            lines.push(buffer.trim_end().to_string());
        }
        CollectedOutput { lines, timed_out }
    }

    fn cold_spec(&self, job: &RenderJob, run_dir: &Path, width: u32, height: u32) -> SandboxSpec {
        let suffix = Uuid::new_v4().simple().to_string();
        SandboxSpec {
            name: format!(
                "{}-cold-{}",
                self.settings.pool.container_prefix,
                &suffix[..8]
            ),
            image: self.settings.execution.cold_image.clone(),
            command: cold_command(&self.settings.execution, width, height),
            // DISPLAY is exported inside the shell once Xvfb is up; only
            // the buffering switch rides in as environment.
            env_vars: std::collections::HashMap::from([(
                "PYTHONUNBUFFERED".to_string(),
                "1".to_string(),
            )]),
            working_dir: None,
            labels: std::collections::HashMap::from([
                (LABEL_APP.to_string(), self.settings.pool.app_label.clone()),
                (LABEL_ROLE.to_string(), COLD_ROLE.to_string()),
            ]),
            memory_bytes: self.settings.limits.memory_bytes,
            cpu_quota: self.settings.limits.cpu_quota,
            network_disabled: self.settings.limits.network_disabled,
            auto_remove: true,
            binds: vec![BindMount {
                host_path: run_dir.display().to_string(),
                container_path: "/work".to_string(),
                readonly: false,
            }],
            tmpfs: self.settings.limits.tmpfs_map(),
            ulimits: self.settings.limits.ulimit_specs(),
            no_new_privileges: true,
        }
    }
}

/// Time left on the job's overall deadline; provisioning and transfer spend
/// from the same budget as log collection.
fn remaining(job: &RenderJob, started: Instant) -> Duration {
    job.deadline.saturating_sub(started.elapsed())
}

/// Housekeeping execs spend from the job budget like every other phase.
fn housekeeping_bound(job: &RenderJob, started: Instant) -> Duration {
    HOUSEKEEPING_TIMEOUT.min(remaining(job, started))
}

/// The stray sweep keeps a floor so a timed-out job still gets cleaned.
fn sweep_bound(job: &RenderJob, started: Instant) -> Duration {
    housekeeping_bound(job, started).max(STRAY_KILL_GRACE)
}

fn tail(lines: &[String], keep: usize) -> Vec<String> {
    let start = lines.len().saturating_sub(keep);
    lines[start..].to_vec()
}

/// One-shot display bring-up plus the interpreter line, sized to the job.
fn cold_command(exec: &ExecutionSettings, width: u32, height: u32) -> Vec<String> {
    let display = exec.display_number;
    let script = format!(
        "Xvfb :{display} -screen 0 {width}x{height}x24 -nolisten tcp & \
         export DISPLAY=:{display} && \
         for i in $(seq 1 50); do xdpyinfo >/dev/null 2>&1 && break; sleep 0.1; done; \
         cd /work && timeout {inner}s {interpreter} main.py",
        display = display,
        width = width,
        height = height,
        inner = exec.inner_timeout_secs,
        interpreter = exec.interpreter,
    );
    vec!["/bin/sh".to_string(), "-c".to_string(), script]
}

/// Shell pass over /proc that kills any process whose command line matches
/// no allowlist entry. PID 1 and the sweep's own shell are always spared.
fn stray_kill_script(security: &SecuritySettings) -> String {
    let pattern = security.baseline_processes.join("|").replace('\'', r"'\''");
    format!(
        "for pid in $(ls /proc | grep -E '^[0-9]+$'); do \
           [ \"$pid\" = \"1\" ] && continue; \
           [ \"$pid\" = \"$$\" ] && continue; \
           cmdline=$(tr '\\0' ' ' < /proc/$pid/cmdline 2>/dev/null | sed 's/ *$//'); \
           [ -z \"$cmdline\" ] && continue; \
           if ! echo \"$cmdline\" | grep -qE '^({pattern})$'; then \
             echo \"killed orphan $pid: $cmdline\"; \
             kill -9 \"$pid\" 2>/dev/null; \
           fi; \
         done",
        pattern = pattern
    )
}
