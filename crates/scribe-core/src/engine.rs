//! Top-level orchestrator wiring: assembles C1-C6 from a validated
//! [`scribe_config::Config`] and an injected [`Collaborators`] set, and
//! spawns the scheduler loop plus the heartbeat ticker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32};

use tokio::sync::{mpsc, Notify};
use tracing::info;

use crate::accelerator::AcceleratorProbe;
use crate::api::{Collaborators, OrchestratorHandle};
use crate::events::{EventBus, ServerEvent};
use crate::memory_pool::MemoryPool;
use crate::queue::TaskQueue;
use crate::scheduler::{SchedulerRuntime, SchedulerShared};

/// Shared, long-lived state behind [`OrchestratorHandle`].
pub(crate) struct OrchestratorInner {
    pub(crate) shared: Arc<SchedulerShared>,
    pub(crate) accelerator: Arc<AcceleratorProbe>,
}

/// Default capacity of the terminal diagnostic log when not otherwise
/// specified.
const TERMINAL_LOG_CAPACITY: usize = 256;

pub(crate) fn start(config: scribe_config::Config, collaborators: Collaborators) -> OrchestratorHandle {
    let events = Arc::new(EventBus::new(config.event_ring_capacity, config.heartbeat_timeout));
    let accelerator = Arc::new(AcceleratorProbe::new(
        collaborators.accelerator,
        config.gpu_snapshot_ttl,
    ));
    let memory = Arc::new(MemoryPool::new(
        config.max_memory_utilization,
        config.memory_confidence_factor,
        config.calibration_sample_size,
        config.reserved_memory_gb_per_gpu,
        config.standard_audio_duration_sec,
        config.audio_duration_factor_slope,
    ));

    let shared = Arc::new(SchedulerShared {
        queue: parking_lot::Mutex::new(TaskQueue::new(TERMINAL_LOG_CAPACITY)),
        events: events.clone(),
        notify: Notify::new(),
        concurrency: AtomicU32::new(config.max_concurrent_tasks_default),
        max_tasks_per_gpu: config.max_tasks_per_gpu,
        max_retries: config.max_retries,
        task_timeout: config.task_timeout,
        stopping: AtomicBool::new(false),
    });

    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let runtime = SchedulerRuntime {
        shared: shared.clone(),
        accelerator: accelerator.clone(),
        memory,
        engine: collaborators.engine,
        renderer: collaborators.renderer,
        audio_meta: collaborators.audio_meta,
        metrics: collaborators.metrics,
        gpu_locks: HashMap::new(),
        internal_tx,
        internal_rx,
        scheduler_tick: config.scheduler_tick,
        active_on_gpu: HashMap::new(),
        running_models: HashMap::new(),
    };

    let heartbeat_events = events.clone();
    let heartbeat_interval = config.heartbeat_interval;
    let heartbeat_stopping = shared.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(heartbeat_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if heartbeat_stopping
                .stopping
                .load(std::sync::atomic::Ordering::SeqCst)
                && heartbeat_events.subscriber_count() == 0
            {
                break;
            }
            heartbeat_events.publish(ServerEvent::Heartbeat { at: chrono::Utc::now() });
        }
    });

    let join = tokio::spawn(async move {
        info!("orchestrator scheduler starting");
        runtime.run().await;
        heartbeat_task.abort();
        info!("orchestrator scheduler stopped");
    });

    let inner = Arc::new(OrchestratorInner { shared, accelerator });
    OrchestratorHandle { inner, join }
}
