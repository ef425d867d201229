//! Public API surface (§6.1): the operations a caller drives the
//! orchestrator through, and the handle that wires an injected set of
//! collaborators into a running instance.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::collaborators::{
    AcceleratorDriver, AudioMetadata, MetricsSink, NoopMetricsSink, OutputRenderer,
    TranscriptionEngine,
};
use crate::error::{OrchestratorError, Result};
use crate::events::ServerEvent;
use crate::types::{is_known_model, GpuDescriptor, GpuId, QueueView, TaskId, TaskSpec, TaskStatus, TaskView};

/// Externally supplied collaborators (§6.2). `metrics` defaults to a
/// no-op sink if not supplied via [`Collaborators::with_metrics`].
pub struct Collaborators {
    /// Speech-to-text backend.
    pub engine: Arc<dyn TranscriptionEngine>,
    /// Output artifact renderer.
    pub renderer: Arc<dyn OutputRenderer>,
    /// Audio duration probe.
    pub audio_meta: Arc<dyn AudioMetadata>,
    /// Accelerator enumeration/reporting.
    pub accelerator: Arc<dyn AcceleratorDriver>,
    /// Metrics sink.
    pub metrics: Arc<dyn MetricsSink>,
}

impl Collaborators {
    /// Build from the four required collaborators, defaulting metrics to
    /// a no-op sink.
    pub fn new(
        engine: Arc<dyn TranscriptionEngine>,
        renderer: Arc<dyn OutputRenderer>,
        audio_meta: Arc<dyn AudioMetadata>,
        accelerator: Arc<dyn AcceleratorDriver>,
    ) -> Self {
        Self {
            engine,
            renderer,
            audio_meta,
            accelerator,
            metrics: Arc::new(NoopMetricsSink),
        }
    }

    /// Replace the default no-op metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Start a new in-process orchestrator instance.
pub fn start_orchestrator(
    config: scribe_config::Config,
    collaborators: Collaborators,
) -> OrchestratorHandle {
    crate::engine::start(config, collaborators)
}

/// Handle to a running orchestrator instance (§6.1).
pub struct OrchestratorHandle {
    pub(crate) inner: Arc<crate::engine::OrchestratorInner>,
    pub(crate) join: tokio::task::JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Admit a new task. Returns `InvalidSpec` if the submission fails
    /// basic validation (empty file list, no formats, empty model name),
    /// if any input file doesn't exist, or if the model isn't recognized
    /// (§4.3).
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId> {
        if spec.files.is_empty() {
            return Err(OrchestratorError::InvalidSpec("no input files".into()));
        }
        if spec.formats.is_empty() {
            return Err(OrchestratorError::InvalidSpec(
                "no output formats requested".into(),
            ));
        }
        if spec.model.trim().is_empty() {
            return Err(OrchestratorError::InvalidSpec("model name is empty".into()));
        }
        for file in &spec.files {
            if !std::path::Path::new(file).exists() {
                return Err(OrchestratorError::InvalidSpec(format!(
                    "input file not found: {file}"
                )));
            }
        }
        if !is_known_model(&spec.model) {
            return Err(OrchestratorError::InvalidSpec(format!(
                "unrecognized model: {}",
                spec.model
            )));
        }

        let (id, task_update) = {
            let mut queue = self.inner.shared.queue.lock();
            let id = queue.submit(spec);
            let task_update = ServerEvent::task_update(queue.get(id).expect("just submitted"));
            (id, task_update)
        };
        self.inner.shared.events.publish(task_update);
        self.inner.shared.wake();
        Ok(id)
    }

    /// Read the current view of a single task.
    pub fn status(&self, id: TaskId) -> Result<TaskView> {
        let queue = self.inner.shared.queue.lock();
        queue
            .get(id)
            .map(|t| t.to_view())
            .ok_or(OrchestratorError::TaskNotFound(id))
    }

    /// Read the current view of every known task.
    pub fn snapshot(&self) -> Vec<TaskView> {
        let queue = self.inner.shared.queue.lock();
        queue.all_tasks().map(|t| t.to_view()).collect()
    }

    /// Split the current task set into pending and running views, alongside
    /// the current in-flight count and concurrency cap (§6.1).
    pub fn list_queue(&self) -> QueueView {
        let (pending, running) = {
            let queue = self.inner.shared.queue.lock();
            let mut pending = Vec::new();
            let mut running = Vec::new();
            for task in queue.all_tasks() {
                match task.status {
                    TaskStatus::Pending | TaskStatus::Retrying => pending.push(task.to_view()),
                    TaskStatus::Loading | TaskStatus::Processing => running.push(task.to_view()),
                    TaskStatus::Completed | TaskStatus::Failed => {}
                }
            }
            (pending, running)
        };
        QueueView {
            current_running_tasks: running.len(),
            max_concurrent_tasks: self.concurrency_get(),
            pending,
            running,
        }
    }

    /// Request cancellation of a task. Idempotent; cancelling an already
    /// terminal task is a no-op.
    pub fn cancel(&self, id: TaskId) -> Result<()> {
        let queue = self.inner.shared.queue.lock();
        let task = queue.get(id).ok_or(OrchestratorError::TaskNotFound(id))?;
        task.cancel.cancel();
        drop(queue);
        self.inner.shared.wake();
        Ok(())
    }

    /// Current value of the runtime-mutable concurrency cap.
    pub fn concurrency_get(&self) -> u32 {
        self.inner
            .shared
            .concurrency
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Set the concurrency cap, clamped to `[1, HARD_CONCURRENCY_LIMIT]`
    /// (§6.3).
    pub fn concurrency_set(&self, value: u32) {
        let clamped = value.clamp(1, scribe_config::HARD_CONCURRENCY_LIMIT);
        self.inner
            .shared
            .concurrency
            .store(clamped, std::sync::atomic::Ordering::Relaxed);
        self.inner.shared.wake();
    }

    /// Current accelerator fleet snapshot.
    pub async fn accelerator_snapshot(&self) -> anyhow::Result<Vec<GpuDescriptor>> {
        self.inner.accelerator.snapshot().await
    }

    /// Accelerator fleet snapshot filtered to one device, if present.
    pub async fn accelerator_status(&self, gpu: GpuId) -> anyhow::Result<Option<GpuDescriptor>> {
        Ok(self
            .inner
            .accelerator
            .snapshot()
            .await?
            .into_iter()
            .find(|g| g.id == gpu))
    }

    /// Subscribe to the event stream (§4.6, §6.1).
    pub fn subscribe(&self) -> mpsc::Receiver<ServerEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Request graceful shutdown: stop admitting new tasks, let in-flight
    /// tasks finish.
    pub fn request_stop(&self) {
        self.inner
            .shared
            .stopping
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner.shared.wake();
    }

    /// Wait for the scheduler loop to exit (after [`Self::request_stop`]).
    pub async fn wait(self) -> anyhow::Result<()> {
        self.join
            .await
            .map_err(|err| anyhow::anyhow!("scheduler task join error: {err}"))
    }
}
