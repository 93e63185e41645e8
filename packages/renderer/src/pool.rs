// ABOUTME: Fixed-size pool of pre-warmed sandbox containers with lease/release
// ABOUTME: Idempotent label-scoped cleanup on initialize, full sweep on drain

use crate::engine::{self, ContainerEngine, SandboxSpec};
use crate::settings::{ExecutionSettings, LimitSettings, PoolSettings, RendererSettings};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Label keys stamped on every pool container; the startup and drain sweeps
/// target exactly these.
pub const LABEL_APP: &str = "vitrine.app";
pub const LABEL_ROLE: &str = "vitrine.role";

/// A leased warm container. Ownership encodes pool state: queued handles
/// are Ready, a handle moved out to a job is Leased, and drain consumes
/// whatever is left. At most `pool.size` handles exist at once.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub container_id: String,
    pub name: String,
}

/// Pre-warmed container pool. Built once at startup next to the metrics
/// sink and shared with the orchestrator by `Arc`.
pub struct SandboxPool {
    engine: Arc<dyn ContainerEngine>,
    pool: PoolSettings,
    limits: LimitSettings,
    execution: ExecutionSettings,
    ready_tx: mpsc::UnboundedSender<SandboxHandle>,
    ready_rx: Mutex<mpsc::UnboundedReceiver<SandboxHandle>>,
    initialized: AtomicBool,
}

impl SandboxPool {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: &RendererSettings) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            pool: settings.pool.clone(),
            limits: settings.limits.clone(),
            execution: settings.execution.clone(),
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
            initialized: AtomicBool::new(false),
        }
    }

    /// Bring the pool up: clear leftovers from a prior run, then provision
    /// containers sequentially. Per-container failures are logged and
    /// skipped; the pool runs with however many succeeded. Returns the
    /// number of Ready handles. Safe to call again; a second call never
    /// leaves survivors or duplicates from the first.
    pub async fn initialize(&self) -> usize {
        if let Err(e) = self.engine.ping().await {
            error!(error = %e, "Container engine unreachable; pool stays uninitialized");
            self.initialized.store(false, Ordering::SeqCst);
            return 0;
        }

        // Stale queue entries from an earlier initialize point at
        // containers the sweep below is about to remove.
        self.discard_queued().await;
        self.sweep_labeled("pre-init cleanup").await;

        let mut provisioned = 0;
        for index in 0..self.pool.size {
            if index > 0 {
                tokio::time::sleep(self.pool.stagger()).await;
            }
            match self.provision(index).await {
                Ok(handle) => {
                    info!(container = %handle.name, "Pool container ready");
                    if self.ready_tx.send(handle).is_err() {
                        warn!("Ready queue closed during initialize");
                        break;
                    }
                    provisioned += 1;
                }
                Err(e) => {
                    warn!(index, error = %e, "Pool container failed to provision; continuing");
                }
            }
        }

        self.initialized.store(provisioned > 0, Ordering::SeqCst);
        if provisioned == 0 {
            warn!("No pool containers available; every job will take the cold path");
        } else {
            info!(provisioned, requested = self.pool.size, "Sandbox pool initialized");
        }
        provisioned
    }

    /// Pop a Ready handle, waiting at most the configured lease timeout.
    /// None when the wait expires or the pool never initialized; the caller
    /// degrades to the cold path rather than queueing.
    pub async fn lease(&self) -> Option<SandboxHandle> {
        if !self.initialized.load(Ordering::SeqCst) {
            return None;
        }

        let waited = timeout(self.execution.lease_wait(), async {
            let mut rx = self.ready_rx.lock().await;
            rx.recv().await
        })
        .await;

        match waited {
            Ok(Some(handle)) => {
                debug!(container = %handle.name, "Leased pool container");
                Some(handle)
            }
            Ok(None) => None,
            Err(_) => {
                debug!("Lease wait expired; no pool container available");
                None
            }
        }
    }

    /// Return a handle to Ready. No-op when the pool was never initialized
    /// (or has been drained); the sweep owns such containers.
    pub async fn release(&self, handle: SandboxHandle) {
        if !self.initialized.load(Ordering::SeqCst) {
            debug!(container = %handle.name, "Pool not initialized; dropping released handle");
            return;
        }
        debug!(container = %handle.name, "Returning container to pool");
        if self.ready_tx.send(handle).is_err() {
            warn!("Ready queue closed; dropping released handle");
        }
    }

    /// Tear everything down: queued handles first, then a label sweep that
    /// also catches leased and leaked containers. Failures are logged,
    /// never raised.
    pub async fn drain(&self) {
        self.initialized.store(false, Ordering::SeqCst);

        let mut queued = Vec::new();
        {
            let mut rx = self.ready_rx.lock().await;
            while let Ok(handle) = rx.try_recv() {
                queued.push(handle);
            }
        }
        for handle in queued {
            if let Err(e) = self.engine.kill_sandbox(&handle.container_id).await {
                warn!(container = %handle.name, error = %e, "Failed to kill pool container");
            }
        }

        self.sweep_labeled("drain").await;
        info!("Sandbox pool drained");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn provision(&self, index: usize) -> engine::Result<SandboxHandle> {
        let spec = self.warm_spec(index);
        let container_id = self.engine.create_sandbox(&spec).await?;
        // Give the display server inside time to come up before the first
        // lease hits it.
        tokio::time::sleep(self.pool.settle_delay()).await;
        Ok(SandboxHandle {
            container_id,
            name: spec.name,
        })
    }

    async fn discard_queued(&self) {
        let mut rx = self.ready_rx.lock().await;
        while rx.try_recv().is_ok() {}
    }

    /// Kill and remove every container carrying this pool's labels,
    /// whatever state it is in.
    async fn sweep_labeled(&self, reason: &str) {
        let labels = self.pool.labels();
        match self.engine.list_labeled(&labels).await {
            Ok(ids) => {
                for container_id in ids {
                    debug!(container_id = %container_id, reason, "Removing labeled container");
                    if let Err(e) = self.engine.kill_sandbox(&container_id).await {
                        debug!(container_id = %container_id, error = %e, "Kill during sweep failed");
                    }
                    if let Err(e) = self.engine.remove_sandbox(&container_id, true).await {
                        debug!(container_id = %container_id, error = %e, "Remove during sweep failed");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, reason, "Could not list pool containers for sweep");
            }
        }
    }

    /// Long-running warm container: virtual display plus a keep-alive loop.
    fn warm_command(&self) -> Vec<String> {
        let display = self.execution.display_number;
        let script = format!(
            "Xvfb :{display} -screen 0 {w}x{h}x24 -nolisten tcp & \
             sleep 3 && export DISPLAY=:{display} && \
             echo 'render pool container ready' && \
             while true; do sleep 30; done",
            display = display,
            w = self.execution.default_width,
            h = self.execution.default_height,
        );
        vec!["/bin/sh".to_string(), "-c".to_string(), script]
    }

    fn warm_spec(&self, index: usize) -> SandboxSpec {
        let suffix = Uuid::new_v4().simple().to_string();
        SandboxSpec {
            name: format!("{}-pool-{}-{}", self.pool.container_prefix, index, &suffix[..8]),
            image: self.pool.image.clone(),
            command: self.warm_command(),
            env_vars: self.execution.env_map(),
            working_dir: None,
            labels: self.pool.labels(),
            memory_bytes: self.limits.memory_bytes,
            cpu_quota: self.limits.cpu_quota,
            network_disabled: self.limits.network_disabled,
            auto_remove: true,
            binds: Vec::new(),
            tmpfs: self.limits.tmpfs_map(),
            ulimits: self.limits.ulimit_specs(),
            no_new_privileges: true,
        }
    }
}
