//! Memory Pool (C2): per-GPU admission accounting, calibrated memory
//! estimation, and reservation bookkeeping (§4.2).

use std::collections::{HashMap, VecDeque};

use parking_lot::{Mutex, RwLock};

use crate::types::{GpuDescriptor, GpuId};

/// Base per-model memory footprint, gigabytes, at the reference audio
/// duration, before any calibration history exists for that `(gpu, model)`
/// pair (§4.2: "characteristic memory...properties" per model size).
/// Ordered most-specific-first so `"large-v3"` matches before the shorter
/// `"large"` key when both are substrings of a model name.
const MODEL_BASE_ESTIMATE_GB: &[(&str, f64)] = &[
    ("large-v3", 10.0),
    ("large-v2", 10.0),
    ("large", 10.0),
    ("turbo", 6.0),
    ("medium", 5.0),
    ("small", 2.0),
    ("base", 1.0),
    ("tiny", 1.0),
];

/// Fallback estimate for a model name matching none of
/// [`MODEL_BASE_ESTIMATE_GB`], gigabytes, at the reference audio duration.
const UNCALIBRATED_ESTIMATE_GB: f64 = 2.0;

/// Minimum calibration samples before the empirical mean/stddev are
/// trusted over the static fallback.
const MIN_SAMPLES_FOR_CALIBRATION: usize = 3;

/// Look up `model`'s base estimate in [`MODEL_BASE_ESTIMATE_GB`] by
/// substring match, falling back to [`UNCALIBRATED_ESTIMATE_GB`] for
/// unrecognized names.
fn base_estimate_gb(model: &str) -> f64 {
    MODEL_BASE_ESTIMATE_GB
        .iter()
        .find(|(key, _)| model.contains(key))
        .map(|(_, gb)| *gb)
        .unwrap_or(UNCALIBRATED_ESTIMATE_GB)
}

/// A held memory reservation against one GPU. Dropping this without
/// calling [`MemoryPool::release`] would leak the reservation — callers
/// must release explicitly once the task's actual usage is known, the
/// same way the teacher requires an explicit lease release rather than
/// relying on `Drop`.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    /// GPU the reservation is held against.
    pub gpu: GpuId,
    /// Reserved amount, gigabytes.
    pub gb: f64,
}

#[derive(Default)]
struct GpuPoolEntry {
    reserved_gb: f64,
    calibration: HashMap<String, VecDeque<f64>>,
}

/// Per-GPU admission pool. One inner mutex per GPU, never a single global
/// pool mutex (§5) — the outer `RwLock` only guards the *set* of known
/// GPUs, which changes on probe refresh, not on the hot reservation path.
pub struct MemoryPool {
    gpus: RwLock<HashMap<GpuId, Mutex<GpuPoolEntry>>>,
    max_memory_utilization: f64,
    memory_confidence_factor: f64,
    calibration_sample_size: usize,
    reserved_memory_gb_per_gpu: f64,
    standard_audio_duration_sec: f64,
    audio_duration_factor_slope: f64,
}

impl MemoryPool {
    /// Build a pool from the subset of [`scribe_config::Config`] fields
    /// that govern admission.
    pub fn new(
        max_memory_utilization: f64,
        memory_confidence_factor: f64,
        calibration_sample_size: usize,
        reserved_memory_gb_per_gpu: f64,
        standard_audio_duration_sec: f64,
        audio_duration_factor_slope: f64,
    ) -> Self {
        Self {
            gpus: RwLock::new(HashMap::new()),
            max_memory_utilization,
            memory_confidence_factor,
            calibration_sample_size,
            reserved_memory_gb_per_gpu,
            standard_audio_duration_sec,
            audio_duration_factor_slope,
        }
    }

    fn ensure_gpu(&self, gpu: GpuId) {
        if self.gpus.read().contains_key(&gpu) {
            return;
        }
        self.gpus
            .write()
            .entry(gpu)
            .or_insert_with(|| Mutex::new(GpuPoolEntry::default()));
    }

    /// Closed-form conservative memory estimate from a calibration sample
    /// set: `mean + stddev * confidence`. Exposed standalone (pure, no
    /// locking) so it can be exercised directly as a property test.
    pub fn calibrate(samples: &[f64], confidence_factor: f64) -> f64 {
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        mean + variance.sqrt() * confidence_factor
    }

    /// `1 + max(0, d/standard - 1) * slope` (§4.2): audio no longer than the
    /// reference duration never discounts the estimate, only longer audio
    /// inflates it.
    fn duration_factor(&self, audio_duration_sec: f64) -> f64 {
        let ratio = audio_duration_sec / self.standard_audio_duration_sec;
        1.0 + self.audio_duration_factor_slope * (ratio - 1.0).max(0.0)
    }

    /// Estimate the memory a task on `model` with `audio_duration_sec` of
    /// input would require on `gpu`, combining calibration history (when
    /// enough samples exist) with the audio-duration factor (§4.2, §9).
    pub fn estimate_required_gb(&self, gpu: GpuId, model: &str, audio_duration_sec: f64) -> f64 {
        self.ensure_gpu(gpu);
        let gpus = self.gpus.read();
        let entry = gpus.get(&gpu).expect("ensure_gpu just inserted it");
        let entry = entry.lock();
        let base = match entry.calibration.get(model) {
            Some(samples) if samples.len() >= MIN_SAMPLES_FOR_CALIBRATION => {
                let samples: Vec<f64> = samples.iter().copied().collect();
                Self::calibrate(&samples, self.memory_confidence_factor)
            }
            _ => base_estimate_gb(model) * self.memory_confidence_factor,
        };
        base * self.duration_factor(audio_duration_sec)
    }

    /// Attempt to reserve `estimated_gb` against `gpu`'s currently reported
    /// free memory. Returns `None` if admission would exceed
    /// `max_memory_utilization` of `gpu.free_gb` net of the per-GPU reserved
    /// floor and any reservations already outstanding.
    pub fn try_reserve(&self, gpu: &GpuDescriptor, estimated_gb: f64) -> Option<Reservation> {
        self.ensure_gpu(gpu.id);
        let gpus = self.gpus.read();
        let entry = gpus.get(&gpu.id).expect("ensure_gpu just inserted it");
        let mut entry = entry.lock();

        let usable = (gpu.free_gb - self.reserved_memory_gb_per_gpu).max(0.0);
        let admissible = usable * self.max_memory_utilization;
        if entry.reserved_gb + estimated_gb > admissible {
            return None;
        }

        entry.reserved_gb += estimated_gb;
        Some(Reservation {
            gpu: gpu.id,
            gb: estimated_gb,
        })
    }

    /// Release a previously granted reservation.
    pub fn release(&self, reservation: Reservation) {
        let gpus = self.gpus.read();
        let Some(entry) = gpus.get(&reservation.gpu) else {
            return;
        };
        let mut entry = entry.lock();
        entry.reserved_gb = (entry.reserved_gb - reservation.gb).max(0.0);
    }

    /// Record the actual peak memory a completed task used, feeding future
    /// estimates for the same `(gpu, model)` pair.
    pub fn record_actual_usage(&self, gpu: GpuId, model: &str, actual_gb: f64) {
        self.ensure_gpu(gpu);
        let gpus = self.gpus.read();
        let entry = gpus.get(&gpu).expect("ensure_gpu just inserted it");
        let mut entry = entry.lock();
        let samples = entry
            .calibration
            .entry(model.to_string())
            .or_insert_with(VecDeque::new);
        samples.push_back(actual_gb);
        while samples.len() > self.calibration_sample_size {
            samples.pop_front();
        }
    }

    /// Currently reserved amount on `gpu`, for diagnostics/snapshots.
    pub fn reserved_gb(&self, gpu: GpuId) -> f64 {
        self.ensure_gpu(gpu);
        let gpus = self.gpus.read();
        gpus.get(&gpu).map(|e| e.lock().reserved_gb).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn gpu(id: GpuId, free_gb: f64) -> GpuDescriptor {
        GpuDescriptor {
            id,
            name: "test".into(),
            total_gb: free_gb,
            used_gb: 0.0,
            free_gb,
            temperature_c: None,
            utilization_pct: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn calibration_closed_form_matches_manual_computation() {
        let samples = [2.0, 2.0, 2.0, 2.0];
        let est = MemoryPool::calibrate(&samples, 1.2);
        assert!((est - 2.0).abs() < 1e-9, "zero-variance sample should equal the mean");

        let samples = [1.0, 2.0, 3.0];
        let mean = 2.0;
        let variance = ((1.0f64 - 2.0).powi(2) + (2.0f64 - 2.0).powi(2) + (3.0f64 - 2.0).powi(2)) / 3.0;
        let expected = mean + variance.sqrt() * 1.5;
        let est = MemoryPool::calibrate(&samples, 1.5);
        assert!((est - expected).abs() < 1e-9);
    }

    #[test]
    fn reservation_is_rejected_once_admissible_budget_is_exhausted() {
        let pool = MemoryPool::new(0.9, 1.2, 50, 1.0, 180.0, 0.3);
        let g = gpu(0, 10.0);
        let first = pool.try_reserve(&g, 8.0);
        assert!(first.is_some());
        let second = pool.try_reserve(&g, 1.0);
        assert!(second.is_none(), "usable budget is (10-1)*0.9=8.1, already at 8.0 reserved");
    }

    #[test]
    fn release_frees_reserved_budget_for_reuse() {
        let pool = MemoryPool::new(0.9, 1.2, 50, 1.0, 180.0, 0.3);
        let g = gpu(0, 10.0);
        let r = pool.try_reserve(&g, 5.0).unwrap();
        pool.release(r);
        assert_eq!(pool.reserved_gb(0), 0.0);
        assert!(pool.try_reserve(&g, 8.0).is_some());
    }

    #[test]
    fn estimate_uses_calibration_once_enough_samples_exist() {
        let pool = MemoryPool::new(0.9, 1.0, 50, 1.0, 180.0, 0.0);
        for _ in 0..5 {
            pool.record_actual_usage(0, "whisper-large", 6.0);
        }
        let est = pool.estimate_required_gb(0, "whisper-large", 180.0);
        assert!((est - 6.0).abs() < 1e-6);
    }

    #[test]
    fn estimate_falls_back_to_flat_constant_for_unrecognized_model() {
        let pool = MemoryPool::new(0.9, 1.2, 50, 1.0, 180.0, 0.0);
        let est = pool.estimate_required_gb(0, "unseen-model", 180.0);
        assert!((est - UNCALIBRATED_ESTIMATE_GB * 1.2).abs() < 1e-6);
    }

    #[test]
    fn estimate_uses_per_model_base_table_without_calibration() {
        let pool = MemoryPool::new(0.9, 1.0, 50, 1.0, 180.0, 0.0);
        let large = pool.estimate_required_gb(0, "whisper-large-v3", 180.0);
        let tiny = pool.estimate_required_gb(1, "whisper-tiny", 180.0);
        assert!((large - 10.0).abs() < 1e-6);
        assert!((tiny - 1.0).abs() < 1e-6);
        assert!(large > tiny, "large-v3 must reserve more than tiny pre-calibration");
    }

    #[test]
    fn longer_audio_increases_estimate() {
        let pool = MemoryPool::new(0.9, 1.2, 50, 1.0, 180.0, 0.5);
        let short = pool.estimate_required_gb(0, "m", 180.0);
        let long = pool.estimate_required_gb(1, "m", 360.0);
        assert!(long > short);
    }
}
