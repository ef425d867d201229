//! Event Bus (C6): per-subscriber bounded delivery with an explicit drop
//! policy (§4.6).
//!
//! The teacher fans out a single `tokio::sync::broadcast` channel to every
//! receiver, so one lagging receiver drops events for *everyone* once the
//! shared channel fills. §4.6 requires per-client independence, so this is
//! generalized to a registry of bounded `mpsc` channels, one per
//! subscriber, each with its own drop counter.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TaskErrorKind;
use crate::types::{Language, Task, TaskId, TaskResultItem, TaskStatus};

/// Event stream payload delivered to subscribers (§4.6, §6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// A task's full current state, published on every status, progress, or
    /// error change so a subscriber never has to reassemble it from
    /// multiple events (§4.6's `task_update`).
    TaskUpdate {
        /// Task id.
        id: TaskId,
        /// Current lifecycle state.
        status: TaskStatus,
        /// Progress in `[0.0, 1.0]`, smoothed per §9.
        progress: f64,
        /// Last human-readable status message.
        message: String,
        /// Requested model name.
        model: String,
        /// Requested language, rendered as `"auto"` or the explicit code.
        language: String,
        /// Input file paths.
        files: Vec<String>,
        /// Submission timestamp.
        created_at: DateTime<Utc>,
        /// When the current attempt started, if any.
        start_time: Option<DateTime<Utc>>,
        /// When the task reached a terminal state, if it has.
        end_time: Option<DateTime<Utc>>,
        /// Number of attempts made so far, minus the first.
        retry_count: u32,
        /// Terminal or most recent error, if any.
        error: Option<(TaskErrorKind, String)>,
        /// Results produced so far (populated once `status == Completed`).
        results: Vec<TaskResultItem>,
    },
    /// Model-fetch sub-progress during `Load` (§4.5, §4.6).
    DownloadProgress {
        /// Task id the fetch is being performed for.
        task_id: TaskId,
        /// Model being fetched.
        model_name: String,
        /// `-1` = failed, `0..99` = in flight, `100` = done.
        progress: i32,
        /// Human-readable status.
        message: String,
    },
    /// Keeps idle subscribers alive and lets the registry detect stalled
    /// receivers.
    Heartbeat {
        /// Server time at emission.
        at: DateTime<Utc>,
    },
    /// One or more events were dropped for this subscriber because its
    /// ring was full.
    Compaction {
        /// Number of events dropped since the last successful delivery.
        dropped: u64,
    },
}

impl ServerEvent {
    /// Build a `TaskUpdate` snapshot from the authoritative task record.
    /// The single construction site for the wire event keeps every field
    /// consistent with `Task`, rather than leaving call sites to assemble
    /// their own partial views of it.
    pub fn task_update(task: &Task) -> Self {
        ServerEvent::TaskUpdate {
            id: task.id,
            status: task.status,
            progress: task.progress,
            message: task.message.clone(),
            model: task.spec.model.clone(),
            language: match &task.spec.language {
                Language::Auto => "auto".to_string(),
                Language::Code(code) => code.clone(),
            },
            files: task.spec.files.clone(),
            created_at: task.submitted_at,
            start_time: task.attempt_started_at,
            end_time: task.finished_at,
            retry_count: task.attempts.saturating_sub(1),
            error: task.error.clone(),
            results: task.results.clone(),
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<ServerEvent>,
    dropped_since_last_send: u64,
    last_sent: Instant,
}

/// Registry of event subscribers with bounded, independent delivery.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    ring_capacity: usize,
    heartbeat_timeout: Duration,
}

impl EventBus {
    /// Build a bus whose subscriber channels each hold up to `ring_capacity`
    /// undelivered events before the oldest is dropped, and whose
    /// subscribers are disconnected after `heartbeat_timeout` without a
    /// successful delivery (§4.6's "missed pong" disconnection — there is
    /// no client-ack channel in this push-only collaborator model, so time
    /// since the last event actually placed on the subscriber's channel is
    /// used as the liveness proxy).
    pub fn new(ring_capacity: usize, heartbeat_timeout: Duration) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            ring_capacity: ring_capacity.max(1),
            heartbeat_timeout,
        }
    }

    /// Register a new subscriber, returning the receiving half of its
    /// channel.
    pub fn subscribe(&self) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(self.ring_capacity);
        self.subscribers.write().push(Subscriber {
            tx,
            dropped_since_last_send: 0,
            last_sent: Instant::now(),
        });
        rx
    }

    /// Publish `event` to every subscriber. A subscriber whose channel is
    /// full has the event dropped and its drop counter incremented; the
    /// counter is flushed as a [`ServerEvent::Compaction`] notice the next
    /// time a send to that subscriber succeeds. Subscribers whose receiver
    /// has been dropped, or who haven't accepted a delivery within the
    /// configured heartbeat timeout, are pruned.
    pub fn publish(&self, event: ServerEvent) {
        let mut subs = self.subscribers.write();
        subs.retain_mut(|sub| {
            if sub.last_sent.elapsed() > self.heartbeat_timeout {
                return false;
            }

            if sub.dropped_since_last_send > 0
                && sub
                    .tx
                    .try_send(ServerEvent::Compaction {
                        dropped: sub.dropped_since_last_send,
                    })
                    .is_ok()
            {
                sub.dropped_since_last_send = 0;
            }

            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    sub.last_sent = Instant::now();
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped_since_last_send += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of currently registered subscribers, for diagnostics.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, TaskSpec};

    fn sample_task() -> Task {
        Task::new(
            1,
            TaskSpec {
                files: vec!["a.wav".to_string()],
                model: "small".to_string(),
                language: Language::Auto,
                formats: vec![],
                priority: Priority::Normal,
                preferred_gpu: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(8, Duration::from_secs(120));
        let mut rx = bus.subscribe();
        bus.publish(ServerEvent::task_update(&sample_task()));
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, ServerEvent::TaskUpdate { id: 1, .. }));
    }

    #[tokio::test]
    async fn full_ring_drops_and_later_reports_compaction() {
        let bus = EventBus::new(1, Duration::from_secs(120));
        let mut rx = bus.subscribe();
        let task = sample_task();
        bus.publish(ServerEvent::task_update(&task));
        bus.publish(ServerEvent::task_update(&task));
        bus.publish(ServerEvent::task_update(&task));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ServerEvent::TaskUpdate { .. }));

        bus.publish(ServerEvent::Heartbeat { at: Utc::now() });
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ServerEvent::Compaction { dropped } if dropped >= 1));
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let bus = EventBus::new(4, Duration::from_secs(120));
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(ServerEvent::Heartbeat { at: Utc::now() });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn independent_subscribers_do_not_affect_each_other() {
        let bus = EventBus::new(1, Duration::from_secs(120));
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();
        bus.publish(ServerEvent::Heartbeat { at: Utc::now() });
        bus.publish(ServerEvent::Heartbeat { at: Utc::now() });
        // slow hasn't polled yet; fast should still get its first event.
        let _ = fast.recv().await.unwrap();
        let _ = slow.recv().await.unwrap();
    }

    #[tokio::test]
    async fn stale_subscriber_is_pruned_after_heartbeat_timeout() {
        let bus = EventBus::new(4, Duration::from_millis(10));
        let _rx = bus.subscribe();
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(ServerEvent::Heartbeat { at: Utc::now() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
