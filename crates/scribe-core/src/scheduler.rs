//! Batch Scheduler (C4): the `tokio::select!`-driven admission loop that
//! ties the queue, accelerator probe, memory pool, worker pipeline, and
//! event bus together (§4.4).
//!
//! Directly grounded on the teacher's engine loop: a timer tick, a
//! `Notify` wakeup (submission/completion/manual trigger), and the
//! worker-completion channel, raced in one `tokio::select!`. "GPU
//! iteration priority" and "model-bucket priority" are recomputed from
//! authoritative state every pass — no cached ordering state carried
//! between ticks (§4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{info, warn};

use crate::accelerator::AcceleratorProbe;
use crate::collaborators::{AudioMetadata, MetricsSink, OutputRenderer, TranscriptionEngine};
use crate::error::TaskErrorKind;
use crate::events::{EventBus, ServerEvent};
use crate::memory_pool::MemoryPool;
use crate::queue::TaskQueue;
use crate::types::{GpuDescriptor, GpuId, TaskId, TaskStatus};
use crate::worker::{run_attempt, mark_attempt_started, AttemptContext, AttemptOutcome, WorkerInternalEvent};

/// Synthetic device id used while operating in CPU-only mode (§4.1, §9):
/// no real accelerator is discoverable, so a single logical device with
/// unlimited memory and a hard cap of one in-flight task stands in.
const CPU_FALLBACK_GPU_ID: GpuId = 0;

/// Static "small-first" size ranking of known model sizes (§4.4). Keywords
/// are matched by substring against the model name, longest match wins —
/// `"large-v2"` must not be classified as the shorter `"large"`. Shared
/// with `Submit`'s recognized-model validation via `crate::types`.
const SIZE_ORDER: &[&str] = crate::types::KNOWN_MODEL_SIZES;

/// Rank of `model` in [`SIZE_ORDER`], or `SIZE_ORDER.len()` (sorted last)
/// for an unrecognized name.
fn model_size_rank(model: &str) -> usize {
    let mut best: Option<usize> = None;
    for (rank, key) in SIZE_ORDER.iter().enumerate() {
        if model.contains(key) {
            best = match best {
                Some(b) if SIZE_ORDER[b].len() >= key.len() => Some(b),
                _ => Some(rank),
            };
        }
    }
    best.unwrap_or(SIZE_ORDER.len())
}

/// Shared state the public API handle and the scheduler loop both touch.
pub(crate) struct SchedulerShared {
    pub(crate) queue: SyncMutex<TaskQueue>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) notify: Notify,
    pub(crate) concurrency: AtomicU32,
    pub(crate) max_tasks_per_gpu: u32,
    pub(crate) max_retries: u32,
    pub(crate) task_timeout: Duration,
    pub(crate) stopping: std::sync::atomic::AtomicBool,
}

impl SchedulerShared {
    /// Wake the scheduler loop immediately rather than waiting for the
    /// next tick.
    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }
}

/// Mutable runtime state private to the scheduler loop (not shared with
/// the public handle).
pub(crate) struct SchedulerRuntime {
    pub(crate) shared: Arc<SchedulerShared>,
    pub(crate) accelerator: Arc<AcceleratorProbe>,
    pub(crate) memory: Arc<MemoryPool>,
    pub(crate) engine: Arc<dyn TranscriptionEngine>,
    pub(crate) renderer: Arc<dyn OutputRenderer>,
    pub(crate) audio_meta: Arc<dyn AudioMetadata>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) gpu_locks: HashMap<GpuId, Arc<AsyncMutex<()>>>,
    pub(crate) internal_tx: mpsc::UnboundedSender<WorkerInternalEvent>,
    pub(crate) internal_rx: mpsc::UnboundedReceiver<WorkerInternalEvent>,
    pub(crate) scheduler_tick: Duration,
    pub(crate) active_on_gpu: HashMap<GpuId, u32>,
    /// Per-GPU refcount of in-flight tasks by model, used for GPU/model
    /// locality priority (§4.4) and to decide when a model has no more
    /// live tasks on a device and can be unloaded (§4.5 step 4).
    pub(crate) running_models: HashMap<GpuId, HashMap<String, u32>>,
}

impl SchedulerRuntime {
    fn gpu_lock(&mut self, gpu: GpuId) -> Arc<AsyncMutex<()>> {
        self.gpu_locks
            .entry(gpu)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn emit(&self, event: ServerEvent) {
        self.shared.events.publish(event);
    }

    /// Publish a `task_update` built from the task's current authoritative
    /// state, so every status/progress/error transition is observable as a
    /// single consistent snapshot rather than partial fields.
    fn emit_task_update(&self, task_id: TaskId) {
        let queue = self.shared.queue.lock();
        if let Some(task) = queue.get(task_id) {
            self.shared.events.publish(ServerEvent::task_update(task));
        }
    }

    fn model_loaded_anywhere(&self, model: &str) -> bool {
        self.running_models
            .values()
            .any(|models| models.get(model).copied().unwrap_or(0) > 0)
    }

    fn running_model_count(&self, gpu: GpuId, model: &str) -> u32 {
        self.running_models
            .get(&gpu)
            .and_then(|models| models.get(model))
            .copied()
            .unwrap_or(0)
    }

    /// Decrement the refcount for `(gpu, model)`; when it reaches zero,
    /// tear the model down on that device (§4.5 step 4).
    async fn release_model_slot(&mut self, gpu: GpuId, model: &str) {
        let now_empty = match self.running_models.get_mut(&gpu) {
            Some(models) => match models.get_mut(model) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    let empty = *count == 0;
                    if empty {
                        models.remove(model);
                    }
                    empty
                }
                None => false,
            },
            None => false,
        };
        if now_empty {
            self.engine.unload(gpu, model).await;
        }
    }

    /// One admission pass: pull pending tasks out of the queue and try to
    /// place them on a GPU with room, highest-free-memory GPU first
    /// ("GPU iteration priority"), each model's highest-priority waiting
    /// task first ("model-bucket priority").
    async fn admit(&mut self) {
        if self.shared.stopping.load(Ordering::SeqCst) {
            return;
        }

        let mut gpus = match self.accelerator.snapshot().await {
            Ok(gpus) => gpus,
            Err(err) => {
                warn!(error = %err, "accelerator snapshot failed, skipping admission pass");
                return;
            }
        };

        // §4.1/§9: no discoverable accelerator degrades to one logical CPU
        // device with unlimited memory and a hard cap of one in-flight task,
        // rather than never scheduling anything.
        let cpu_fallback = gpus.is_empty();
        if cpu_fallback {
            gpus.push(GpuDescriptor {
                id: CPU_FALLBACK_GPU_ID,
                name: "cpu".into(),
                total_gb: f64::MAX,
                used_gb: 0.0,
                free_gb: f64::MAX,
                temperature_c: None,
                utilization_pct: None,
                updated_at: chrono::Utc::now(),
            });
        }
        let per_gpu_cap = if cpu_fallback { 1 } else { self.shared.max_tasks_per_gpu };

        let concurrency_cap = self.shared.concurrency.load(Ordering::Relaxed);
        let (mut models, peek_ages) = {
            let queue = self.shared.queue.lock();
            if queue.in_flight_count() as u32 >= concurrency_cap {
                return;
            }
            let models = queue.models_with_pending_work();
            let ages: HashMap<String, chrono::DateTime<chrono::Utc>> = models
                .iter()
                .filter_map(|m| {
                    queue
                        .peek_next_pending(m)
                        .and_then(|id| queue.get(id))
                        .map(|t| (m.clone(), t.submitted_at))
                })
                .collect();
            (models, ages)
        };

        // Model-bucket priority (§4.4): buckets whose model is already
        // loaded somewhere come first, then a static small-first size
        // ranking, ties broken by the age of the head queued task.
        models.sort_by(|a, b| {
            let a_local = self.model_loaded_anywhere(a);
            let b_local = self.model_loaded_anywhere(b);
            b_local
                .cmp(&a_local)
                .then_with(|| model_size_rank(a).cmp(&model_size_rank(b)))
                .then_with(|| peek_ages.get(a).cmp(&peek_ages.get(b)))
        });

        for model in models {
            // GPU iteration priority (§4.4): GPUs already running this
            // model first (amortize model-load cost locally), then the
            // GPU with the most free memory.
            let mut candidates = gpus.clone();
            candidates.sort_by(|x, y| {
                let x_local = self.running_model_count(x.id, &model) > 0;
                let y_local = self.running_model_count(y.id, &model) > 0;
                y_local
                    .cmp(&x_local)
                    .then_with(|| y.free_gb.partial_cmp(&x.free_gb).unwrap_or(std::cmp::Ordering::Equal))
            });

            for gpu in &candidates {
                let active = *self.active_on_gpu.get(&gpu.id).unwrap_or(&0);
                if active >= per_gpu_cap {
                    continue;
                }
                {
                    let queue = self.shared.queue.lock();
                    if queue.in_flight_count() as u32 >= concurrency_cap {
                        return;
                    }
                }

                let task_id = {
                    let mut queue = self.shared.queue.lock();
                    match queue.pop_next_pending(&model) {
                        Some(id) => id,
                        None => break,
                    }
                };

                self.try_dispatch(&model, gpu.id, gpu.free_gb, task_id).await;
            }
        }
    }

    async fn try_dispatch(&mut self, model: &str, gpu: GpuId, _free_gb: f64, task_id: TaskId) {
        let (files, formats, language, duration_probe_path) = {
            let queue = self.shared.queue.lock();
            let Some(task) = queue.get(task_id) else {
                return;
            };
            (
                task.spec.files.clone(),
                task.spec.formats.clone(),
                task.spec.language.clone(),
                task.spec.files.first().cloned(),
            )
        };

        let audio_duration = match duration_probe_path {
            Some(path) => self.audio_meta.duration_sec(&path).await.unwrap_or(0.0),
            None => 0.0,
        };
        let estimated_gb = self.memory.estimate_required_gb(gpu, model, audio_duration);

        let gpu_descriptor = match self.accelerator.snapshot().await {
            Ok(gpus) => gpus.into_iter().find(|g| g.id == gpu),
            Err(_) => None,
        };
        let Some(gpu_descriptor) = gpu_descriptor else {
            let mut queue = self.shared.queue.lock();
            queue.requeue_front(task_id);
            return;
        };

        let Some(reservation) = self.memory.try_reserve(&gpu_descriptor, estimated_gb) else {
            let mut queue = self.shared.queue.lock();
            queue.requeue_front(task_id);
            return;
        };

        let cancel = {
            let mut queue = self.shared.queue.lock();
            let Some(task) = queue.get_mut(task_id) else {
                self.memory.release(reservation);
                return;
            };
            task.status = TaskStatus::Loading;
            task.assigned_gpu = Some(gpu);
            task.attempts += 1;
            mark_attempt_started(task);
            task.message = format!("dispatched to gpu {gpu}");
            task.updated_at = chrono::Utc::now();
            task.cancel.clone()
        };

        *self.active_on_gpu.entry(gpu).or_insert(0) += 1;
        *self
            .running_models
            .entry(gpu)
            .or_default()
            .entry(model.to_string())
            .or_insert(0) += 1;
        self.metrics.incr("scribe_task_dispatched", 1);
        self.emit_task_update(task_id);
        info!(task_id, gpu, model, "dispatched to worker");

        let ctx = AttemptContext {
            task_id,
            gpu,
            model: model.to_string(),
            language,
            files,
            formats,
            reservation,
            cancel,
            gpu_lock: self.gpu_lock(gpu),
            timeout: self.shared.task_timeout,
            engine: self.engine.clone(),
            renderer: self.renderer.clone(),
            audio_meta: self.audio_meta.clone(),
        };
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            run_attempt(ctx, internal_tx).await;
        });
    }

    fn sweep_timeouts(&mut self) {
        let now = chrono::Utc::now();
        let mut timed_out = Vec::new();
        {
            let queue = self.shared.queue.lock();
            for task in queue.all_tasks() {
                if matches!(task.status, TaskStatus::Loading | TaskStatus::Processing) {
                    if let Some(started) = task.attempt_started_at {
                        let elapsed = now.signed_duration_since(started);
                        if elapsed.to_std().unwrap_or(Duration::ZERO) > self.shared.task_timeout {
                            task.cancel.cancel();
                            timed_out.push(task.id);
                        }
                    }
                }
            }
        }
        for id in timed_out {
            warn!(task_id = id, "task cancelled by timeout sweep");
        }
    }

    async fn handle_internal_event(&mut self, ev: WorkerInternalEvent) {
        match ev {
            WorkerInternalEvent::StatusChanged { task_id, status, message } => {
                {
                    let mut queue = self.shared.queue.lock();
                    if let Some(task) = queue.get_mut(task_id) {
                        task.status = status;
                        task.message = message;
                        task.updated_at = chrono::Utc::now();
                    }
                }
                self.emit_task_update(task_id);
            }
            WorkerInternalEvent::Progress { task_id, progress } => {
                {
                    let mut queue = self.shared.queue.lock();
                    if let Some(task) = queue.get_mut(task_id) {
                        // Progress is monotonic non-decreasing (§3).
                        task.progress = task.progress.max(progress);
                        task.updated_at = chrono::Utc::now();
                    }
                }
                self.emit_task_update(task_id);
            }
            WorkerInternalEvent::Download(event) => {
                self.emit(event);
            }
            WorkerInternalEvent::Finished {
                task_id,
                reservation,
                outcome,
            } => {
                self.memory.release(reservation);
                if let Some(count) = self.active_on_gpu.get_mut(&reservation.gpu) {
                    *count = count.saturating_sub(1);
                }

                let model = self.shared.queue.lock().get(task_id).map(|t| t.spec.model.clone());
                if let Some(model) = &model {
                    self.release_model_slot(reservation.gpu, model).await;
                }

                match outcome {
                    AttemptOutcome::Success {
                        results,
                        actual_peak_gb,
                    } => {
                        {
                            let mut queue = self.shared.queue.lock();
                            if let Some(task) = queue.get_mut(task_id) {
                                task.results = results;
                                task.progress = 1.0;
                                task.message = "completed".to_string();
                            }
                            queue.finish(task_id, TaskStatus::Completed);
                        }
                        if let Some(model) = &model {
                            self.memory
                                .record_actual_usage(reservation.gpu, model, actual_peak_gb);
                        }
                        self.metrics.incr("scribe_task_completed", 1);
                        self.emit_task_update(task_id);
                    }
                    AttemptOutcome::Failure { kind, detail } => {
                        self.handle_failure(task_id, kind, detail).await;
                    }
                }
            }
        }
    }

    async fn handle_failure(&mut self, task_id: TaskId, kind: TaskErrorKind, detail: String) {
        let (attempts, will_retry) = {
            let mut queue = self.shared.queue.lock();
            let Some(task) = queue.get_mut(task_id) else {
                return;
            };
            task.error = Some((kind, detail.clone()));
            let retryable = kind.is_retryable() && task.attempts <= self.shared.max_retries;
            task.status = if retryable {
                TaskStatus::Retrying
            } else {
                TaskStatus::Failed
            };
            task.message = detail.clone();
            task.updated_at = chrono::Utc::now();
            (task.attempts, retryable)
        };

        if will_retry {
            // §7: a retry is observable as `status = Retrying` followed by
            // a new `status = Pending`, not as a terminal failure event.
            self.emit_task_update(task_id);
            info!(task_id, attempts, "retrying after {kind:?}");

            {
                let mut queue = self.shared.queue.lock();
                if let Some(task) = queue.get_mut(task_id) {
                    task.status = TaskStatus::Pending;
                    task.updated_at = chrono::Utc::now();
                }
            }
            self.emit_task_update(task_id);

            let mut queue = self.shared.queue.lock();
            // §4.3: a retry rejoins the tail of its model's bucket, no
            // priority boost over tasks already waiting at the same level.
            queue.requeue_back(task_id);
        } else {
            self.metrics.incr("scribe_task_failed", 1);
            {
                let mut queue = self.shared.queue.lock();
                queue.finish(task_id, TaskStatus::Failed);
            }
            self.emit_task_update(task_id);
        }
    }

    /// Drive the scheduler until `shared.stopping` is observed and no
    /// tasks remain active.
    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(self.scheduler_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let stopping = self.shared.stopping.load(Ordering::SeqCst);
            let idle = self.shared.queue.lock().active_count() == 0;
            if stopping && idle {
                break;
            }

            tokio::select! {
                _ = tick.tick() => {
                    self.sweep_timeouts();
                    self.admit().await;
                }
                _ = self.shared.notify.notified() => {
                    self.admit().await;
                }
                ev = self.internal_rx.recv() => {
                    if let Some(ev) = ev {
                        self.handle_internal_event(ev).await;
                        self.admit().await;
                    }
                }
            }
        }
    }
}
