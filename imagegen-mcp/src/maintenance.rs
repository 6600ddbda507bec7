//! Periodic retention sweep, size-limit enforcement and cache eviction.

use crate::cache::{CacheableOutput, RequestCache};
use crate::storage::{ArtifactStore, SweepReport};
use imagegen_mcp_common::config::StorageConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub retention: SweepReport,
    pub size_limit: SweepReport,
    pub cache_evicted: usize,
}

/// Run one pass: retention sweep, then the size limit, then cache expiry.
///
/// Failures are logged; the next pass tries again.
pub async fn run_once<T: CacheableOutput>(
    store: &ArtifactStore,
    cache: &RequestCache<T>,
    config: &StorageConfig,
) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();
    match store.run_retention_sweep(config.retention()).await {
        Ok(sweep) => report.retention = sweep,
        Err(e) => error!(error = %e, "Retention sweep failed"),
    }
    match store.enforce_size_limit(config.max_size_bytes()).await {
        Ok(sweep) => report.size_limit = sweep,
        Err(e) => error!(error = %e, "Size limit enforcement failed"),
    }
    report.cache_evicted = cache.evict_expired().await;
    report
}

/// Spawn the maintenance loop. The first pass runs immediately; the loop
/// ends when `shutdown` flips to `true` or its sender is dropped.
pub fn spawn<T: CacheableOutput>(
    store: Arc<ArtifactStore>,
    cache: Arc<RequestCache<T>>,
    config: StorageConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = config.cleanup_interval().max(Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = period.as_secs(), "Maintenance task started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = run_once(&store, &cache, &config).await;
                    info!(
                        expired = report.retention.deleted,
                        orphans = report.retention.orphans_removed,
                        over_limit = report.size_limit.deleted,
                        cache_evicted = report.cache_evicted,
                        "Maintenance pass finished"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Maintenance task stopped");
    })
}
