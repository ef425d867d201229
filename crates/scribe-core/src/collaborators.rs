//! External collaborator contracts (§6.2).
//!
//! The real transcription engine, GPU driver, and output rendering targets
//! are out of scope for this crate (§1) — they are injected as trait
//! objects with thin contracts, the same way the teacher injects an HTTP
//! `reqwest::Client` + `SubmitterConfig` rather than hard-wiring network
//! I/O into the engine. Each trait ships a deterministic stub used by
//! tests and by any deployment that has not wired up the real thing yet,
//! grounded on `dictum-core`'s `StubModel`.

use async_trait::async_trait;

use crate::error::TaskErrorKind;
use crate::types::{GpuDescriptor, GpuId, Language, OutputFormat, Segment, TaskResultItem};

/// Raw transcription result for one input file, before output rendering.
#[derive(Debug, Clone)]
pub struct RawTranscript {
    /// Segments produced by the model, in order.
    pub segments: Vec<Segment>,
    /// Full transcript text as produced by the engine, not a naive join of
    /// `segments` (§6.2).
    pub text: String,
    /// Language the engine detected, if it performs detection. Always
    /// populated regardless of the requested [`Language`]; the caller
    /// decides whether to persist it (§4.5 step 3: only when the request
    /// was [`Language::Auto`]).
    pub detected_language: Option<String>,
}

/// A failure reported by a collaborator, pre-classified into the same
/// taxonomy a task attempt uses (§7) so the worker can map it directly.
#[derive(Debug, Clone)]
pub struct CollaboratorError {
    /// Classification of the failure.
    pub kind: TaskErrorKind,
    /// Human-readable detail, logged and surfaced in `TaskView::error`.
    pub detail: String,
}

impl CollaboratorError {
    /// Build a fatal, non-retryable engine error.
    pub fn fatal(detail: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::EngineFatal,
            detail: detail.into(),
        }
    }

    /// Build a transient, retryable engine error.
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::EngineTransient,
            detail: detail.into(),
        }
    }
}

/// Speech-to-text backend. A real implementation would bind to
/// whisper.cpp or an ONNX runtime session; loading a model is expected to
/// be the expensive step and is therefore a distinct method from
/// transcribing, matching the `Load` / `Transcribe` stage split in §4.5.
#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// Load `model` onto `gpu`, ready to accept `transcribe` calls. May be
    /// a no-op for backends that load lazily.
    async fn load(&self, gpu: GpuId, model: &str) -> Result<(), CollaboratorError>;

    /// Transcribe a single input file already loaded on `gpu`.
    async fn transcribe(
        &self,
        gpu: GpuId,
        model: &str,
        input_path: &str,
        language: &Language,
    ) -> Result<RawTranscript, CollaboratorError>;

    /// Release resources held for `model` on `gpu`, called once no other
    /// live task on that device uses it (§4.5 step 4). Default no-op for
    /// backends with no per-model GPU state to tear down.
    async fn unload(&self, _gpu: GpuId, _model: &str) {}
}

/// Renders a [`RawTranscript`] into a requested on-disk output format and
/// writes it durably (§6.4: temp file + rename, never a partial file at the
/// final path).
#[async_trait]
pub trait OutputRenderer: Send + Sync {
    /// Render `transcript` as `format` for `input_path`, returning the path
    /// of the artifact written.
    async fn render(
        &self,
        input_path: &str,
        format: OutputFormat,
        transcript: &RawTranscript,
    ) -> Result<String, CollaboratorError>;
}

/// Probes static facts about an input file ahead of scheduling — currently
/// only duration, used by the memory-estimate duration factor (§4.2).
#[async_trait]
pub trait AudioMetadata: Send + Sync {
    /// Duration of the file at `input_path`, in seconds.
    async fn duration_sec(&self, input_path: &str) -> Result<f64, CollaboratorError>;
}

/// Enumerates and reports on accelerators. A real implementation binds to
/// NVML or an equivalent vendor API.
#[async_trait]
pub trait AcceleratorDriver: Send + Sync {
    /// List every accelerator visible to this process, with current memory
    /// and utilization figures.
    async fn snapshot(&self) -> Result<Vec<GpuDescriptor>, CollaboratorError>;
}

/// Non-blocking metrics emission. Ambient (not named in spec.md's
/// enumerated collaborator list) but required by the Design Notes'
/// "logging/metrics must be non-blocking" guidance; the default
/// implementation is a no-op, as real sinks are a deployment concern.
pub trait MetricsSink: Send + Sync {
    /// Record a named counter increment with an amount.
    fn incr(&self, _name: &'static str, _amount: u64) {}
    /// Record a named gauge observation.
    fn gauge(&self, _name: &'static str, _value: f64) {}
}

/// No-op metrics sink, the default when a deployment has not wired up a
/// real one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {}

/// Accelerator driver stub reporting zero devices — used when running
/// without GPU access (CPU-only fallback, §9).
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuOnlyDriver;

#[async_trait]
impl AcceleratorDriver for CpuOnlyDriver {
    async fn snapshot(&self) -> Result<Vec<GpuDescriptor>, CollaboratorError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use chrono::Utc;
    use parking_lot::Mutex;

    use super::*;

    /// Deterministic accelerator driver reporting a fixed fleet of
    /// synthetic GPUs, optionally mutated between snapshots by tests.
    pub struct FakeDriver {
        pub gpus: Mutex<Vec<GpuDescriptor>>,
    }

    impl FakeDriver {
        pub fn new(count: u32, total_gb: f64) -> Self {
            let gpus = (0..count)
                .map(|id| GpuDescriptor {
                    id,
                    name: format!("fake-gpu-{id}"),
                    total_gb,
                    used_gb: 0.0,
                    free_gb: total_gb,
                    temperature_c: Some(45.0),
                    utilization_pct: Some(0.0),
                    updated_at: Utc::now(),
                })
                .collect();
            Self {
                gpus: Mutex::new(gpus),
            }
        }
    }

    #[async_trait]
    impl AcceleratorDriver for FakeDriver {
        async fn snapshot(&self) -> Result<Vec<GpuDescriptor>, CollaboratorError> {
            Ok(self.gpus.lock().clone())
        }
    }

    /// Deterministic transcription engine: `load` always succeeds after a
    /// configurable delay, `transcribe` returns one fixed segment per file
    /// unless `input_path` is present in `fail_on`, in which case it
    /// returns the configured error.
    pub struct DeterministicEngine {
        pub load_delay_ms: u64,
        pub transcribe_delay_ms: u64,
        pub fail_on: HashMap<String, CollaboratorError>,
    }

    impl DeterministicEngine {
        pub fn new() -> Self {
            Self {
                load_delay_ms: 0,
                transcribe_delay_ms: 0,
                fail_on: HashMap::new(),
            }
        }
    }

    #[async_trait]
    impl TranscriptionEngine for DeterministicEngine {
        async fn load(&self, _gpu: GpuId, _model: &str) -> Result<(), CollaboratorError> {
            if self.load_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.load_delay_ms)).await;
            }
            Ok(())
        }

        async fn transcribe(
            &self,
            _gpu: GpuId,
            _model: &str,
            input_path: &str,
            _language: &Language,
        ) -> Result<RawTranscript, CollaboratorError> {
            if self.transcribe_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.transcribe_delay_ms))
                    .await;
            }
            if let Some(err) = self.fail_on.get(input_path) {
                return Err(err.clone());
            }
            let text = format!("transcript of {input_path}");
            Ok(RawTranscript {
                segments: vec![Segment {
                    start_sec: 0.0,
                    end_sec: 1.0,
                    text: text.clone(),
                }],
                text,
                detected_language: Some("en".to_string()),
            })
        }
    }

    /// Renderer that writes nothing to disk and returns a synthetic path,
    /// for tests that only care about scheduling behavior.
    pub struct NullRenderer;

    #[async_trait]
    impl OutputRenderer for NullRenderer {
        async fn render(
            &self,
            input_path: &str,
            format: OutputFormat,
            _transcript: &RawTranscript,
        ) -> Result<String, CollaboratorError> {
            Ok(format!("{input_path}.{format:?}"))
        }
    }

    /// Audio metadata stub reporting a fixed duration for every file.
    pub struct FixedDuration(pub f64);

    #[async_trait]
    impl AudioMetadata for FixedDuration {
        async fn duration_sec(&self, _input_path: &str) -> Result<f64, CollaboratorError> {
            Ok(self.0)
        }
    }
}
