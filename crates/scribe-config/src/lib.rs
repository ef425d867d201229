#![deny(unreachable_pub)]

//! Typed, validated configuration for the transcription orchestrator.
//!
//! The source system reads environment-driven, dynamically typed settings
//! scattered across the process. Here they are collected into one immutable
//! [`Config`] record, loaded once at startup and validated against the table
//! below. The single field that can change after startup —
//! `max_concurrent_tasks` — is *not* part of this struct; the orchestrator
//! keeps it in an `AtomicU32` guarded by its own clamp (see `scribe-core`).

mod env;

use std::time::Duration;

pub use env::load_from_env;

/// Hard ceiling for `Concurrency.Set`, independent of configuration.
pub const HARD_CONCURRENCY_LIMIT: u32 = 20;

/// Immutable configuration loaded once at process startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Initial value for the runtime-mutable concurrency cap.
    pub max_concurrent_tasks_default: u32,
    /// Per-GPU cap on simultaneously in-flight (Loading/Processing) tasks.
    pub max_tasks_per_gpu: u32,
    /// Fraction of total GPU memory the pool is allowed to use.
    pub max_memory_utilization: f64,
    /// Multiplier applied to `mean + stddev` (or to the static table estimate)
    /// to produce a conservative memory estimate.
    pub memory_confidence_factor: f64,
    /// Maximum number of calibration samples retained per `(gpu, model)`.
    pub calibration_sample_size: usize,
    /// Memory floor reserved for the OS/driver, per GPU, in GB.
    pub reserved_memory_gb_per_gpu: f64,
    /// Batch scheduler wakeup interval.
    pub scheduler_tick: Duration,
    /// TTL for cached accelerator snapshots.
    pub gpu_snapshot_ttl: Duration,
    /// Maximum retries before a task becomes terminally Failed.
    pub max_retries: u32,
    /// Wall-clock timeout for a single task.
    pub task_timeout: Duration,
    /// Heartbeat cadence sent to event-bus subscribers.
    pub heartbeat_interval: Duration,
    /// Time without a received pong before a subscriber is disconnected.
    pub heartbeat_timeout: Duration,
    /// Reference audio duration used by the duration factor (seconds).
    pub standard_audio_duration_sec: f64,
    /// Slope of the audio-duration memory factor.
    pub audio_duration_factor_slope: f64,
    /// Per-subscriber event ring capacity (ambient: not in spec.md's
    /// enumerated table, but required to implement §4.6's back-pressure
    /// policy).
    pub event_ring_capacity: usize,
}

/// A configuration value fell outside its documented range.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `field` was `value`, which falls outside `[min, max]`.
    #[error("{field} = {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// The value that failed validation.
        value: f64,
        /// Minimum accepted value (inclusive).
        min: f64,
        /// Maximum accepted value (inclusive).
        max: f64,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_tasks_default: 3,
            max_tasks_per_gpu: 5,
            max_memory_utilization: 0.9,
            memory_confidence_factor: 1.2,
            calibration_sample_size: 50,
            reserved_memory_gb_per_gpu: 1.0,
            scheduler_tick: Duration::from_millis(2000),
            gpu_snapshot_ttl: Duration::from_millis(30_000),
            max_retries: 3,
            task_timeout: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_millis(30_000),
            heartbeat_timeout: Duration::from_millis(120_000),
            standard_audio_duration_sec: 180.0,
            audio_duration_factor_slope: 0.3,
            event_ring_capacity: 128,
        }
    }
}

impl Config {
    /// Validate every field against its documented range. Does not clamp —
    /// out-of-range configuration is a startup error, per the Design Notes'
    /// "single immutable configuration record... validated against the
    /// enumerated table".
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
            if value < min || value > max {
                return Err(ConfigError::OutOfRange {
                    field,
                    value,
                    min,
                    max,
                });
            }
            Ok(())
        }

        check(
            "max_concurrent_tasks_default",
            self.max_concurrent_tasks_default as f64,
            1.0,
            HARD_CONCURRENCY_LIMIT as f64,
        )?;
        check("max_tasks_per_gpu", self.max_tasks_per_gpu as f64, 1.0, 1024.0)?;
        check("max_memory_utilization", self.max_memory_utilization, 0.0, 1.0)?;
        check("memory_confidence_factor", self.memory_confidence_factor, 0.0, 10.0)?;
        check(
            "calibration_sample_size",
            self.calibration_sample_size as f64,
            1.0,
            100_000.0,
        )?;
        check(
            "reserved_memory_gb_per_gpu",
            self.reserved_memory_gb_per_gpu,
            0.0,
            1024.0,
        )?;
        check("max_retries", self.max_retries as f64, 0.0, 100.0)?;
        check(
            "standard_audio_duration_sec",
            self.standard_audio_duration_sec,
            1.0,
            86_400.0,
        )?;
        check(
            "audio_duration_factor_slope",
            self.audio_duration_factor_slope,
            0.0,
            10.0,
        )?;
        check("event_ring_capacity", self.event_ring_capacity as f64, 1.0, 1_000_000.0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn rejects_out_of_range_utilization() {
        let mut cfg = Config::default();
        cfg.max_memory_utilization = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_concurrency_default() {
        let mut cfg = Config::default();
        cfg.max_concurrent_tasks_default = 0;
        assert!(cfg.validate().is_err());
    }
}
