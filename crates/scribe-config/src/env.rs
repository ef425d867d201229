//! Environment-variable loader for [`Config`](crate::Config).
//!
//! Every field has a documented default (§6.3); an unset or empty variable
//! falls back to it rather than erroring, matching the teacher's
//! `env = "BBR_..."` clap convention of optional environment overrides.

use std::time::Duration;

use crate::Config;

fn env_f64(name: &str, default: f64) -> anyhow::Result<f64> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<f64>()
            .map_err(|e| anyhow::anyhow!("{name}: invalid float {raw:?}: {e}")),
        _ => Ok(default),
    }
}

fn env_u32(name: &str, default: u32) -> anyhow::Result<u32> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<u32>()
            .map_err(|e| anyhow::anyhow!("{name}: invalid integer {raw:?}: {e}")),
        _ => Ok(default),
    }
}

fn env_u64_ms(name: &str, default_ms: u64) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            let ms = raw
                .trim()
                .parse::<u64>()
                .map_err(|e| anyhow::anyhow!("{name}: invalid integer {raw:?}: {e}"))?;
            Ok(Duration::from_millis(ms))
        }
        _ => Ok(Duration::from_millis(default_ms)),
    }
}

/// Load configuration from `SCRIBE_*` environment variables, falling back to
/// [`Config::default`] for anything unset, then validate the result.
pub fn load_from_env() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let cfg = Config {
        max_concurrent_tasks_default: env_u32(
            "SCRIBE_MAX_CONCURRENT_TASKS_DEFAULT",
            defaults.max_concurrent_tasks_default,
        )?,
        max_tasks_per_gpu: env_u32("SCRIBE_MAX_TASKS_PER_GPU", defaults.max_tasks_per_gpu)?,
        max_memory_utilization: env_f64(
            "SCRIBE_MAX_MEMORY_UTILIZATION",
            defaults.max_memory_utilization,
        )?,
        memory_confidence_factor: env_f64(
            "SCRIBE_MEMORY_CONFIDENCE_FACTOR",
            defaults.memory_confidence_factor,
        )?,
        calibration_sample_size: env_u32(
            "SCRIBE_CALIBRATION_SAMPLE_SIZE",
            defaults.calibration_sample_size as u32,
        )? as usize,
        reserved_memory_gb_per_gpu: env_f64(
            "SCRIBE_RESERVED_MEMORY_GB_PER_GPU",
            defaults.reserved_memory_gb_per_gpu,
        )?,
        scheduler_tick: env_u64_ms(
            "SCRIBE_SCHEDULER_TICK_MS",
            defaults.scheduler_tick.as_millis() as u64,
        )?,
        gpu_snapshot_ttl: env_u64_ms(
            "SCRIBE_GPU_SNAPSHOT_TTL_MS",
            defaults.gpu_snapshot_ttl.as_millis() as u64,
        )?,
        max_retries: env_u32("SCRIBE_MAX_RETRIES", defaults.max_retries)?,
        task_timeout: Duration::from_secs(env_u32(
            "SCRIBE_TASK_TIMEOUT_SEC",
            defaults.task_timeout.as_secs() as u32,
        )? as u64),
        heartbeat_interval: env_u64_ms(
            "SCRIBE_HEARTBEAT_INTERVAL_MS",
            defaults.heartbeat_interval.as_millis() as u64,
        )?,
        heartbeat_timeout: env_u64_ms(
            "SCRIBE_HEARTBEAT_TIMEOUT_MS",
            defaults.heartbeat_timeout.as_millis() as u64,
        )?,
        standard_audio_duration_sec: env_f64(
            "SCRIBE_STANDARD_AUDIO_DURATION_SEC",
            defaults.standard_audio_duration_sec,
        )?,
        audio_duration_factor_slope: env_f64(
            "SCRIBE_AUDIO_DURATION_FACTOR_SLOPE",
            defaults.audio_duration_factor_slope,
        )?,
        event_ring_capacity: env_u32(
            "SCRIBE_EVENT_RING_CAPACITY",
            defaults.event_ring_capacity as u32,
        )? as usize,
    };

    cfg.validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_env_falls_back_to_defaults() {
        let cfg = load_from_env().expect("defaults must load");
        assert_eq!(cfg, Config::default());
    }
}
