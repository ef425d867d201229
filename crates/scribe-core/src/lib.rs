#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Concurrent transcription orchestrator: GPU admission, task queueing,
//! batch scheduling, worker lifecycle, and event fan-out for a
//! multi-model, multi-GPU transcription service.
//!
//! The transcription engine itself, the GPU driver, and any HTTP surface
//! are external collaborators with thin contracts (see [`collaborators`])
//! — this crate owns only the orchestration: admission control, a
//! priority task queue, a batch scheduler, per-task worker pipelines, and
//! an event bus.

/// Public API: operations, collaborator injection, and the running handle.
pub mod api;
/// External collaborator contracts and their deterministic stubs.
pub mod collaborators;
/// Error taxonomy for the public API and task attempts.
pub mod error;
/// Event bus payloads.
pub mod events;
/// Deterministic, runnable collaborator implementations.
pub mod stubs;
/// Shared data types: tasks, GPUs, DTOs.
pub mod types;

mod accelerator;
mod engine;
mod memory_pool;
mod queue;
mod scheduler;
mod worker;

pub use api::{start_orchestrator, Collaborators, OrchestratorHandle};
pub use error::{OrchestratorError, Result};
pub use events::ServerEvent;
pub use types::{
    GpuDescriptor, GpuId, Language, OutputFormat, Priority, QueueView, Segment, Task, TaskId,
    TaskResultItem, TaskSpec, TaskStatus, TaskView, TerminalRecord,
};
