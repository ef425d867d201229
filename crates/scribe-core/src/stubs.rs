//! Deterministic, public collaborator implementations (§6.2). These are
//! not test doubles — they are suitable for running the orchestrator end
//! to end (the CLI demo binary uses them) while a deployment has not yet
//! wired up a real GPU driver, speech model, or audio probe. Grounded on
//! the teacher's pattern of shipping a runnable default (`CpuOnlyDriver`)
//! alongside the trait it implements.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::collaborators::{
    AcceleratorDriver, AudioMetadata, CollaboratorError, OutputRenderer, RawTranscript,
    TranscriptionEngine,
};
use crate::types::{GpuDescriptor, GpuId, Language, OutputFormat, Segment};

/// Accelerator driver reporting a fixed fleet of synthetic GPUs, for
/// exercising the scheduler without real NVML access.
pub struct SimulatedAcceleratorDriver {
    gpus: Mutex<Vec<GpuDescriptor>>,
}

impl SimulatedAcceleratorDriver {
    /// Build a driver reporting `count` devices, each with `total_gb` of
    /// memory and nothing in use.
    pub fn new(count: u32, total_gb: f64) -> Self {
        let gpus = (0..count)
            .map(|id| GpuDescriptor {
                id,
                name: format!("simulated-gpu-{id}"),
                total_gb,
                used_gb: 0.0,
                free_gb: total_gb,
                temperature_c: Some(40.0),
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
impl AcceleratorDriver for SimulatedAcceleratorDriver {
    async fn snapshot(&self) -> Result<Vec<GpuDescriptor>, CollaboratorError> {
        Ok(self.gpus.lock().clone())
    }
}

/// Transcription engine that fabricates evenly-spaced segments instead of
/// calling into a real speech model. Deterministic given the same input
/// path, and fast enough to demonstrate the scheduling pipeline
/// end to end.
#[derive(Debug, Default)]
pub struct SimulatedTranscriptionEngine {
    /// Delay injected before `load` returns, simulating a model fetch.
    pub load_delay: Duration,
    /// Delay injected before `transcribe` returns.
    pub transcribe_delay: Duration,
}

#[async_trait]
impl TranscriptionEngine for SimulatedTranscriptionEngine {
    async fn load(&self, _gpu: GpuId, _model: &str) -> Result<(), CollaboratorError> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
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
        if !self.transcribe_delay.is_zero() {
            tokio::time::sleep(self.transcribe_delay).await;
        }
        let name = Path::new(input_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(input_path);
        let segments: Vec<Segment> = (0..3)
            .map(|i| Segment {
                start_sec: i as f64 * 2.0,
                end_sec: (i + 1) as f64 * 2.0,
                text: format!("segment {} of {name}", i + 1),
            })
            .collect();
        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(RawTranscript {
            segments,
            text,
            detected_language: Some("en".to_string()),
        })
    }
}

/// Audio metadata stub deriving a duration from the input path's byte sum
/// so repeated demo runs stay consistent without ever reading the file.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathHashAudioMetadata;

#[async_trait]
impl AudioMetadata for PathHashAudioMetadata {
    async fn duration_sec(&self, input_path: &str) -> Result<f64, CollaboratorError> {
        let sum: u64 = input_path.bytes().map(u64::from).sum();
        Ok(10.0 + (sum % 170) as f64)
    }
}

/// Renders transcripts to sibling files next to the input path, one per
/// requested format, via temp-file-then-rename (§6.4: never a partial
/// file visible at the final path), grounded on the teacher's
/// `InflightStore::persist_file`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsOutputRenderer;

#[async_trait]
impl OutputRenderer for FsOutputRenderer {
    async fn render(
        &self,
        input_path: &str,
        format: OutputFormat,
        transcript: &RawTranscript,
    ) -> Result<String, CollaboratorError> {
        let ext = match format {
            OutputFormat::PlainText => "txt",
            OutputFormat::Srt => "srt",
            OutputFormat::Vtt => "vtt",
            OutputFormat::Structured => "json",
        };
        let final_path = format!("{input_path}.{ext}");
        let contents = render_body(format, transcript)
            .map_err(|err| CollaboratorError::fatal(format!("render {format:?}: {err}")))?;

        let write_path = final_path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&write_path, &contents))
            .await
            .map_err(|err| CollaboratorError::fatal(format!("render task join: {err}")))?
            .map_err(|err| CollaboratorError::fatal(format!("write {final_path}: {err}")))?;

        Ok(final_path)
    }
}

fn render_body(format: OutputFormat, transcript: &RawTranscript) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::PlainText => transcript.text.clone(),
        OutputFormat::Srt => {
            let mut out = String::new();
            for (i, seg) in transcript.segments.iter().enumerate() {
                out.push_str(&format!(
                    "{}\n{} --> {}\n{}\n\n",
                    i + 1,
                    srt_timestamp(seg.start_sec),
                    srt_timestamp(seg.end_sec),
                    seg.text,
                ));
            }
            out
        }
        OutputFormat::Vtt => {
            let mut out = String::from("WEBVTT\n\n");
            for seg in &transcript.segments {
                out.push_str(&format!(
                    "{} --> {}\n{}\n\n",
                    vtt_timestamp(seg.start_sec),
                    vtt_timestamp(seg.end_sec),
                    seg.text,
                ));
            }
            out
        }
        OutputFormat::Structured => serde_json::to_string_pretty(&transcript.segments)?,
    })
}

fn srt_timestamp(sec: f64) -> String {
    let (h, m, s, ms) = split_timestamp(sec);
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

fn vtt_timestamp(sec: f64) -> String {
    let (h, m, s, ms) = split_timestamp(sec);
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

fn split_timestamp(sec: f64) -> (i64, i64, i64, i64) {
    let millis = (sec * 1000.0).round() as i64;
    let (h, rem) = (millis / 3_600_000, millis % 3_600_000);
    let (m, rem) = (rem / 60_000, rem % 60_000);
    let (s, ms) = (rem / 1000, rem % 1000);
    (h, m, s, ms)
}

fn write_atomic(final_path: &str, contents: &str) -> anyhow::Result<()> {
    let final_path = Path::new(final_path);
    if let Some(dir) = final_path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let tmp_name = format!(
        "{}.tmp",
        final_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("out")
    );
    let tmp_path = final_path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, final_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_engine_produces_segments() {
        let engine = SimulatedTranscriptionEngine::default();
        engine.load(0, "whisper-base").await.unwrap();
        let transcript = engine
            .transcribe(0, "whisper-base", "clip.wav", &Language::Auto)
            .await
            .unwrap();
        assert_eq!(transcript.segments.len(), 3);
    }

    #[tokio::test]
    async fn path_hash_duration_is_deterministic() {
        let meta = PathHashAudioMetadata;
        let a = meta.duration_sec("clip.wav").await.unwrap();
        let b = meta.duration_sec("clip.wav").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn fs_renderer_writes_plain_text_atomically() {
        let dir = std::env::temp_dir().join(format!("scribe-render-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("clip.wav");
        let transcript = RawTranscript {
            segments: vec![Segment {
                start_sec: 0.0,
                end_sec: 1.0,
                text: "hello".into(),
            }],
            text: "hello".into(),
            detected_language: Some("en".into()),
        };
        let renderer = FsOutputRenderer;
        let path = renderer
            .render(input.to_str().unwrap(), OutputFormat::PlainText, &transcript)
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "hello");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn fs_renderer_writes_srt_cues() {
        let dir = std::env::temp_dir().join(format!("scribe-render-srt-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("clip.wav");
        let transcript = RawTranscript {
            segments: vec![Segment {
                start_sec: 0.0,
                end_sec: 1.5,
                text: "hello".into(),
            }],
            text: "hello".into(),
            detected_language: Some("en".into()),
        };
        let renderer = FsOutputRenderer;
        let path = renderer
            .render(input.to_str().unwrap(), OutputFormat::Srt, &transcript)
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("00:00:00,000 --> 00:00:01,500"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
