//! Accelerator Probe (C1): enumerates GPUs and caches their state for a
//! short TTL so admission checks don't hammer the driver on every
//! scheduler tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::collaborators::AcceleratorDriver;
use crate::types::GpuDescriptor;

/// Caching wrapper around an injected [`AcceleratorDriver`].
///
/// The cache is a single `RwLock` read under a shared lock on the hot path;
/// a miss takes the write path to refresh, matching the read-mostly access
/// pattern of a probe that's consulted every scheduler tick but only needs
/// to hit the driver every few seconds.
pub struct AcceleratorProbe {
    driver: Arc<dyn AcceleratorDriver>,
    ttl: Duration,
    cache: RwLock<Option<(Instant, Vec<GpuDescriptor>)>>,
}

impl AcceleratorProbe {
    /// Build a probe over `driver`, caching snapshots for `ttl`.
    pub fn new(driver: Arc<dyn AcceleratorDriver>, ttl: Duration) -> Self {
        Self {
            driver,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Return the current GPU fleet, refreshing the cache if it is missing
    /// or stale.
    pub async fn snapshot(&self) -> anyhow::Result<Vec<GpuDescriptor>> {
        if let Some(cached) = self.cached_if_fresh() {
            return Ok(cached);
        }
        let fresh = self
            .driver
            .snapshot()
            .await
            .map_err(|e| anyhow::anyhow!("{}: {}", "accelerator driver", e.detail))?;
        *self.cache.write() = Some((Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    /// Force a refresh on the next call to [`Self::snapshot`].
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    fn cached_if_fresh(&self) -> Option<Vec<GpuDescriptor>> {
        let guard = self.cache.read();
        let (taken_at, gpus) = guard.as_ref()?;
        if taken_at.elapsed() < self.ttl {
            Some(gpus.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::collaborators::test_support::FakeDriver;

    use super::*;

    #[tokio::test]
    async fn snapshot_reflects_driver_fleet() {
        let driver = Arc::new(FakeDriver::new(2, 24.0));
        let probe = AcceleratorProbe::new(driver, Duration::from_millis(50));
        let snap = probe.snapshot().await.unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].total_gb, 24.0);
    }

    #[tokio::test]
    async fn snapshot_is_cached_within_ttl() {
        let driver = Arc::new(FakeDriver::new(1, 24.0));
        let probe = AcceleratorProbe::new(driver.clone(), Duration::from_millis(200));
        let first = probe.snapshot().await.unwrap();
        driver.gpus.lock()[0].used_gb = 10.0;
        let second = probe.snapshot().await.unwrap();
        assert_eq!(first[0].used_gb, second[0].used_gb);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let driver = Arc::new(FakeDriver::new(1, 24.0));
        let probe = AcceleratorProbe::new(driver.clone(), Duration::from_millis(10_000));
        let _ = probe.snapshot().await.unwrap();
        driver.gpus.lock()[0].used_gb = 10.0;
        probe.invalidate();
        let refreshed = probe.snapshot().await.unwrap();
        assert_eq!(refreshed[0].used_gb, 10.0);
    }
}
