//! Shared data types: task identity, GPU descriptors, and the DTOs that
//! cross the public API boundary (§3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::TaskErrorKind;

/// Monotonic task identifier. Simple, total-ordered, cheap to log.
pub type TaskId = u64;

/// Accelerator identifier, stable for the lifetime of the process.
pub type GpuId = u32;

/// Recognized model-size keywords (§4.4's "static small-first ranking" and
/// the glossary's enumerated model list), longest-match-wins. Shared by the
/// scheduler's locality/size ranking and `Submit`'s "model is recognized"
/// validation (§4.3) so both read from the same list.
pub const KNOWN_MODEL_SIZES: &[&str] = &[
    "tiny", "base", "small", "medium", "large", "large-v2", "large-v3", "turbo",
];

/// Whether `model` contains one of [`KNOWN_MODEL_SIZES`] as a substring.
pub fn is_known_model(model: &str) -> bool {
    KNOWN_MODEL_SIZES.iter().any(|key| model.contains(key))
}

/// Scheduling priority. Ordered `High < Normal < Low` by [`Priority::rank`],
/// not by derived `Ord`, so the numeric meaning of "higher priority first"
/// stays explicit at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Serviced ahead of all other priorities within a model bucket.
    High,
    /// Default priority.
    Normal,
    /// Serviced only after High and Normal buckets are empty.
    Low,
}

impl Priority {
    /// Lower rank means serviced first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    /// All priorities in service order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Requested output artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Plain concatenated text, no timing.
    PlainText,
    /// SubRip subtitle format.
    Srt,
    /// WebVTT subtitle format.
    Vtt,
    /// Structured JSON: segments with timing and metadata.
    Structured,
}

/// Requested transcription language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Auto-detect per file.
    Auto,
    /// Explicit ISO 639-1-ish code, e.g. `"en"`.
    Code(String),
}

/// Coarse task lifecycle state, reported in [`TaskView`]. Kept separate from
/// the detail fields (error, retry count, results) the same way a status
/// enum is kept separate from its event payload elsewhere in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Admitted into the queue, not yet dispatched to a worker.
    Pending,
    /// Worker is loading the model/audio onto the assigned GPU.
    Loading,
    /// Worker is running inference.
    Processing,
    /// Finished successfully; results available.
    Completed,
    /// Exhausted retries or hit a fatal error.
    Failed,
    /// Between attempts, waiting to be re-queued.
    Retrying,
}

/// One transcript segment with timing, used by [`OutputFormat::Structured`]
/// and as the common unit rendered into SRT/VTT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Segment start offset, seconds.
    pub start_sec: f64,
    /// Segment end offset, seconds.
    pub end_sec: f64,
    /// Transcribed text for this segment.
    pub text: String,
}

/// Transcription output for a single input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultItem {
    /// Path of the input audio file this result covers.
    pub input_path: String,
    /// Ordered transcript segments.
    pub segments: Vec<Segment>,
    /// Full transcript text as produced by the engine, not a naive join of
    /// `segments` (§6.2: `Transcribe(...) -> {segments, text, detected_language}`).
    pub text: String,
    /// Language the engine detected for this input, persisted when the
    /// task's requested language was [`Language::Auto`] (§4.5 step 3).
    pub detected_language: Option<String>,
    /// Paths of rendered output artifacts, one per requested format.
    pub output_paths: HashMap<OutputFormat, String>,
}

/// Accelerator snapshot as reported by [`crate::collaborators::AcceleratorDriver`]
/// and surfaced through `Accelerator.Snapshot` (§6.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDescriptor {
    /// Stable accelerator identifier.
    pub id: GpuId,
    /// Human-readable device name.
    pub name: String,
    /// Total device memory, GB.
    pub total_gb: f64,
    /// Memory currently reported in use, GB.
    pub used_gb: f64,
    /// Memory currently reported free, GB.
    pub free_gb: f64,
    /// Device temperature, Celsius, if the driver reports it.
    pub temperature_c: Option<f32>,
    /// Compute utilization percentage, if the driver reports it.
    pub utilization_pct: Option<f32>,
    /// When this snapshot was taken.
    pub updated_at: DateTime<Utc>,
}

/// Submission payload for `Submit` (§6.1). Distinct from [`Task`] the same
/// way a job summary is distinct from the mutable state a worker advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Input audio file paths.
    pub files: Vec<String>,
    /// Model name; used both for memory calibration keys and dispatch.
    pub model: String,
    /// Requested language.
    pub language: Language,
    /// Output artifacts to render on completion.
    pub formats: Vec<OutputFormat>,
    /// Scheduling priority.
    pub priority: Priority,
    /// Optional GPU affinity hint; advisory, not a hard constraint (§9,
    /// locality-preferred scheduling without mandated reuse).
    pub preferred_gpu: Option<GpuId>,
}

/// Read-only status/snapshot projection of a [`Task`], returned by `Status`
/// and `Snapshot` (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    /// Task identifier.
    pub id: TaskId,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Requested model name.
    pub model: String,
    /// Requested priority.
    pub priority: Priority,
    /// GPU currently (or most recently) assigned, if any.
    pub assigned_gpu: Option<GpuId>,
    /// Number of attempts made so far, including the current one.
    pub attempts: u32,
    /// Terminal or most recent error, if any.
    pub error: Option<(TaskErrorKind, String)>,
    /// Results produced so far (populated once `status == Completed`).
    pub results: Vec<TaskResultItem>,
    /// Estimated progress in `[0.0, 1.0]`, smoothed per §9.
    pub progress: f64,
    /// Last human-readable status message (§3: "last message").
    pub message: String,
    /// Number of attempts made so far, minus the first (§3: "retry count").
    pub retry_count: u32,
    /// When the task was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When the current attempt started, if any (§3: "start timestamp").
    pub start_time: Option<DateTime<Utc>>,
    /// When the task reached a terminal state, if it has (§3: "end timestamp").
    pub end_time: Option<DateTime<Utc>>,
    /// When the task most recently changed status.
    pub updated_at: DateTime<Utc>,
}

/// Internal, mutable task record owned by the task queue (C3). Advanced in
/// place by the scheduler and worker; [`TaskView`] is taken from this for
/// any caller-visible read.
#[derive(Debug)]
pub struct Task {
    /// Task identifier.
    pub id: TaskId,
    /// Original submission.
    pub spec: TaskSpec,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// GPU currently (or most recently) assigned.
    pub assigned_gpu: Option<GpuId>,
    /// When the current attempt entered `Loading`, used for the wall-clock
    /// timeout sweep (§5, §7).
    pub attempt_started_at: Option<DateTime<Utc>>,
    /// Attempts made so far.
    pub attempts: u32,
    /// Terminal or most recent error.
    pub error: Option<(TaskErrorKind, String)>,
    /// Results accumulated across inputs.
    pub results: Vec<TaskResultItem>,
    /// Smoothed progress estimate.
    pub progress: f64,
    /// Last human-readable status message, surfaced verbatim in `task_update`.
    pub message: String,
    /// Submission timestamp.
    pub submitted_at: DateTime<Utc>,
    /// When the task reached a terminal state, if it has.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last status-change timestamp.
    pub updated_at: DateTime<Utc>,
    /// Cancellation handle, checked at stage boundaries by the worker (§5).
    pub cancel: CancellationToken,
}

impl Task {
    /// Construct a new `Pending` task from a submission.
    pub fn new(id: TaskId, spec: TaskSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            spec,
            status: TaskStatus::Pending,
            assigned_gpu: None,
            attempt_started_at: None,
            attempts: 0,
            error: None,
            results: Vec::new(),
            progress: 0.0,
            message: String::new(),
            submitted_at: now,
            finished_at: None,
            updated_at: now,
            cancel: CancellationToken::new(),
        }
    }

    /// Project the caller-visible view of this task.
    pub fn to_view(&self) -> TaskView {
        TaskView {
            id: self.id,
            status: self.status,
            model: self.spec.model.clone(),
            priority: self.spec.priority,
            assigned_gpu: self.assigned_gpu,
            attempts: self.attempts,
            error: self.error.clone(),
            results: self.results.clone(),
            progress: self.progress,
            message: self.message.clone(),
            retry_count: self.attempts.saturating_sub(1),
            submitted_at: self.submitted_at,
            start_time: self.attempt_started_at,
            end_time: self.finished_at,
            updated_at: self.updated_at,
        }
    }
}

/// Aggregate queue view returned by `ListQueue` (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueView {
    /// Tasks not yet dispatched to a worker (`Pending` or `Retrying`).
    pub pending: Vec<TaskView>,
    /// Tasks currently occupying a GPU (`Loading` or `Processing`).
    pub running: Vec<TaskView>,
    /// `running.len()`, surfaced directly so callers don't recompute it.
    pub current_running_tasks: usize,
    /// Current value of the runtime-mutable concurrency cap.
    pub max_concurrent_tasks: u32,
}

/// Bounded diagnostic record kept for tasks that left the queue terminally
/// (§3's "failed-terminal log for diagnostics").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalRecord {
    /// Task identifier.
    pub id: TaskId,
    /// Model that was requested.
    pub model: String,
    /// Final status (`Completed` or `Failed`).
    pub status: TaskStatus,
    /// Terminal error, if the task failed.
    pub error: Option<(TaskErrorKind, String)>,
    /// When the task left the queue.
    pub finished_at: DateTime<Utc>,
}
