//! Worker / Lifecycle (C5): the per-task pipeline (Load → Transcribe →
//! Finalize → Release), spawned as an individual Tokio task per
//! concurrently running task (§4.5).
//!
//! Unlike a fixed pool of long-lived worker loops, task memory footprint —
//! not worker-slot count — is the binding constraint here, so each task
//! gets its own short-lived task rather than being dispatched to one of N
//! pre-spawned workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{AudioMetadata, CollaboratorError, OutputRenderer, TranscriptionEngine};
use crate::error::TaskErrorKind;
use crate::events::ServerEvent;
use crate::memory_pool::Reservation;
use crate::types::{GpuId, Language, TaskId, TaskResultItem, TaskStatus};

/// Progress is re-emitted at least this often while a single transcribe
/// call is in flight (§4.5).
const PROGRESS_HEARTBEAT: Duration = Duration::from_secs(2);

/// Reported back to the scheduler by a finished task attempt. The
/// scheduler owns the authoritative [`crate::types::Task`] record, so a
/// worker reports raw deltas (status, progress) rather than a
/// ready-to-publish event — the scheduler mutates the task and builds a
/// single [`ServerEvent::task_update`] from it.
pub(crate) enum WorkerInternalEvent {
    /// The task entered a new lifecycle status.
    StatusChanged {
        task_id: TaskId,
        status: TaskStatus,
        message: String,
    },
    /// The task's smoothed progress estimate advanced.
    Progress { task_id: TaskId, progress: f64 },
    /// Model-fetch sub-progress; forwarded to the event bus unchanged.
    Download(ServerEvent),
    /// The attempt finished, successfully or not.
    Finished {
        task_id: TaskId,
        reservation: Reservation,
        outcome: AttemptOutcome,
    },
}

/// Result of one worker attempt.
pub(crate) enum AttemptOutcome {
    /// All inputs transcribed and rendered.
    Success {
        results: Vec<TaskResultItem>,
        actual_peak_gb: f64,
    },
    /// The attempt failed; `kind` classifies whether a retry is eligible.
    Failure { kind: TaskErrorKind, detail: String },
}

impl From<CollaboratorError> for AttemptOutcome {
    fn from(err: CollaboratorError) -> Self {
        AttemptOutcome::Failure {
            kind: err.kind,
            detail: err.detail,
        }
    }
}

/// Everything a single attempt needs, handed in by the scheduler at
/// dispatch time. Deliberately owns `Arc`s rather than borrowing so the
/// spawned task has no lifetime tied to the scheduler loop.
pub(crate) struct AttemptContext {
    pub task_id: TaskId,
    pub gpu: GpuId,
    pub model: String,
    pub language: Language,
    pub files: Vec<String>,
    pub formats: Vec<crate::types::OutputFormat>,
    pub reservation: Reservation,
    pub cancel: CancellationToken,
    pub gpu_lock: Arc<AsyncMutex<()>>,
    pub timeout: Duration,
    pub engine: Arc<dyn TranscriptionEngine>,
    pub renderer: Arc<dyn OutputRenderer>,
    pub audio_meta: Arc<dyn AudioMetadata>,
}

/// Run one attempt of `ctx.task_id` to completion (or failure) and send
/// the outcome through `internal_tx`. Never panics on collaborator
/// failure — every fallible step is mapped into an [`AttemptOutcome`].
pub(crate) async fn run_attempt(
    ctx: AttemptContext,
    internal_tx: tokio::sync::mpsc::UnboundedSender<WorkerInternalEvent>,
) {
    let outcome = tokio::time::timeout(ctx.timeout, drive_attempt(&ctx, &internal_tx)).await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(task_id = ctx.task_id, gpu = ctx.gpu, "task exceeded timeout");
            AttemptOutcome::Failure {
                kind: TaskErrorKind::TaskTimeout,
                detail: format!("attempt exceeded {:?}", ctx.timeout),
            }
        }
    };

    let _ = internal_tx.send(WorkerInternalEvent::Finished {
        task_id: ctx.task_id,
        reservation: ctx.reservation,
        outcome,
    });
}

type InternalTx = tokio::sync::mpsc::UnboundedSender<WorkerInternalEvent>;

fn report_download(tx: &InternalTx, event: ServerEvent) {
    let _ = tx.send(WorkerInternalEvent::Download(event));
}

fn report_status(tx: &InternalTx, task_id: TaskId, status: TaskStatus, message: impl Into<String>) {
    let _ = tx.send(WorkerInternalEvent::StatusChanged {
        task_id,
        status,
        message: message.into(),
    });
}

fn report_progress(tx: &InternalTx, task_id: TaskId, progress: f64) {
    let _ = tx.send(WorkerInternalEvent::Progress { task_id, progress });
}

async fn drive_attempt(ctx: &AttemptContext, tx: &InternalTx) -> AttemptOutcome {
    if ctx.cancel.is_cancelled() {
        return AttemptOutcome::Failure {
            kind: TaskErrorKind::ClientCancelled,
            detail: "cancelled before load".into(),
        };
    }

    info!(task_id = ctx.task_id, gpu = ctx.gpu, model = %ctx.model, "loading model");

    // Held for the duration of Load+Transcribe: the engine must not be
    // re-entered on the same device from another worker (§5).
    let _gpu_guard = ctx.gpu_lock.lock().await;

    report_download(
        tx,
        ServerEvent::DownloadProgress {
            task_id: ctx.task_id,
            model_name: ctx.model.clone(),
            progress: 0,
            message: "loading model".into(),
        },
    );

    if let Err(err) = ctx.engine.load(ctx.gpu, &ctx.model).await {
        report_download(
            tx,
            ServerEvent::DownloadProgress {
                task_id: ctx.task_id,
                model_name: ctx.model.clone(),
                progress: -1,
                message: err.detail.clone(),
            },
        );
        return err.into();
    }

    report_download(
        tx,
        ServerEvent::DownloadProgress {
            task_id: ctx.task_id,
            model_name: ctx.model.clone(),
            progress: 100,
            message: "model ready".into(),
        },
    );

    if ctx.cancel.is_cancelled() {
        return AttemptOutcome::Failure {
            kind: TaskErrorKind::ClientCancelled,
            detail: "cancelled after load, before transcribe".into(),
        };
    }

    report_status(tx, ctx.task_id, TaskStatus::Processing, "transcribing");
    info!(task_id = ctx.task_id, gpu = ctx.gpu, "transcribing");

    let mut results = Vec::with_capacity(ctx.files.len());
    let mut peak_gb = 0.0f64;
    let total_files = ctx.files.len().max(1);

    for (idx, input_path) in ctx.files.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return AttemptOutcome::Failure {
                kind: TaskErrorKind::ClientCancelled,
                detail: format!("cancelled after {idx} of {} files", ctx.files.len()),
            };
        }

        let transcript =
            match transcribe_with_heartbeat(ctx, tx, idx, total_files, input_path).await {
                Ok(t) => t,
                Err(err) => return err.into(),
            };

        debug!(
            task_id = ctx.task_id,
            input_path,
            segments = transcript.segments.len(),
            "transcribed"
        );

        let duration = ctx
            .audio_meta
            .duration_sec(input_path)
            .await
            .unwrap_or(0.0);
        peak_gb = peak_gb.max(ctx.reservation.gb * (1.0 + duration / 3600.0).min(1.5));

        let mut output_paths = std::collections::HashMap::new();
        for format in &ctx.formats {
            match ctx.renderer.render(input_path, *format, &transcript).await {
                Ok(path) => {
                    output_paths.insert(*format, path);
                }
                Err(err) => return err.into(),
            }
        }

        let detected_language = if matches!(ctx.language, Language::Auto) {
            transcript.detected_language.clone()
        } else {
            None
        };

        results.push(TaskResultItem {
            input_path: input_path.clone(),
            segments: transcript.segments,
            text: transcript.text,
            detected_language,
            output_paths,
        });

        // Progress is monotonic non-decreasing (§3); `files_done / total`
        // after each completed input is always >= the prior report.
        report_progress(tx, ctx.task_id, (idx + 1) as f64 / total_files as f64);
    }

    report_status(tx, ctx.task_id, TaskStatus::Processing, "finalized");
    info!(task_id = ctx.task_id, gpu = ctx.gpu, "finalized");

    AttemptOutcome::Success {
        results,
        actual_peak_gb: peak_gb,
    }
}

/// Drive one `transcribe` call, re-reporting the in-progress fraction every
/// [`PROGRESS_HEARTBEAT`] if the call runs long, per §4.5's "at least every
/// 2s during Processing".
async fn transcribe_with_heartbeat(
    ctx: &AttemptContext,
    tx: &InternalTx,
    idx: usize,
    total_files: usize,
    input_path: &str,
) -> Result<crate::collaborators::RawTranscript, CollaboratorError> {
    let call = ctx
        .engine
        .transcribe(ctx.gpu, &ctx.model, input_path, &ctx.language);
    tokio::pin!(call);

    let mut ticker = tokio::time::interval(PROGRESS_HEARTBEAT);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            result = &mut call => return result,
            _ = ticker.tick() => {
                report_progress(tx, ctx.task_id, idx as f64 / total_files as f64);
            }
        }
    }
}

/// Stamp a task's attempt start time, for the scheduler's timeout sweep.
pub(crate) fn mark_attempt_started(task: &mut crate::types::Task) {
    task.attempt_started_at = Some(Utc::now());
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::collaborators::test_support::{DeterministicEngine, FixedDuration, NullRenderer};
    use crate::types::OutputFormat;

    use super::*;

    fn ctx(task_id: TaskId, engine: Arc<dyn TranscriptionEngine>) -> AttemptContext {
        AttemptContext {
            task_id,
            gpu: 0,
            model: "whisper-base".into(),
            language: Language::Auto,
            files: vec!["a.wav".into()],
            formats: vec![OutputFormat::PlainText],
            reservation: Reservation { gpu: 0, gb: 2.0 },
            cancel: CancellationToken::new(),
            gpu_lock: Arc::new(AsyncMutex::new(())),
            timeout: Duration::from_secs(5),
            engine,
            renderer: Arc::new(NullRenderer),
            audio_meta: Arc::new(FixedDuration(30.0)),
        }
    }

    /// Drain progress events until the attempt's terminal `Finished` event.
    async fn recv_finished(
        rx: &mut mpsc::UnboundedReceiver<WorkerInternalEvent>,
    ) -> (TaskId, Reservation, AttemptOutcome) {
        loop {
            match rx.recv().await.expect("channel closed before Finished") {
                WorkerInternalEvent::Finished {
                    task_id,
                    reservation,
                    outcome,
                } => return (task_id, reservation, outcome),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn successful_attempt_reports_finished_with_results() {
        let engine = Arc::new(DeterministicEngine::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_attempt(ctx(1, engine), tx).await;
        let (task_id, _, outcome) = recv_finished(&mut rx).await;
        assert_eq!(task_id, 1);
        assert!(matches!(outcome, AttemptOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn successful_attempt_reports_processing_and_file_progress() {
        let engine = Arc::new(DeterministicEngine::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_attempt(ctx(1, engine), tx).await;

        let mut saw_processing = false;
        let mut saw_full_progress = false;
        loop {
            match rx.recv().await.unwrap() {
                WorkerInternalEvent::StatusChanged { status: TaskStatus::Processing, .. } => {
                    saw_processing = true;
                }
                WorkerInternalEvent::Progress { progress, .. } if progress >= 1.0 => {
                    saw_full_progress = true;
                }
                WorkerInternalEvent::Finished { .. } => break,
                _ => {}
            }
        }
        assert!(saw_processing, "expected a Processing status-change event");
        assert!(saw_full_progress, "expected a file-completion progress event");
    }

    #[tokio::test]
    async fn transcribe_failure_maps_to_engine_transient() {
        let mut engine = DeterministicEngine::new();
        engine.fail_on.insert(
            "a.wav".into(),
            CollaboratorError::transient("simulated overload"),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_attempt(ctx(2, Arc::new(engine)), tx).await;
        let (_, _, outcome) = recv_finished(&mut rx).await;
        match outcome {
            AttemptOutcome::Failure { kind, .. } => {
                assert_eq!(kind, TaskErrorKind::EngineTransient);
            }
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn cancellation_before_load_is_observable() {
        let engine = Arc::new(DeterministicEngine::new());
        let mut c = ctx(3, engine);
        c.cancel.cancel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_attempt(c, tx).await;
        let (_, _, outcome) = recv_finished(&mut rx).await;
        match outcome {
            AttemptOutcome::Failure { kind, .. } => {
                assert_eq!(kind, TaskErrorKind::ClientCancelled);
            }
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn attempt_exceeding_timeout_is_reported_as_task_timeout() {
        let mut engine = DeterministicEngine::new();
        engine.transcribe_delay_ms = 50;
        let mut c = ctx(4, Arc::new(engine));
        c.timeout = Duration::from_millis(5);
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_attempt(c, tx).await;
        let (_, _, outcome) = recv_finished(&mut rx).await;
        match outcome {
            AttemptOutcome::Failure { kind, .. } => {
                assert_eq!(kind, TaskErrorKind::TaskTimeout);
            }
            _ => panic!("expected failure"),
        }
    }
}
