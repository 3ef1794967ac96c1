//! Periodic address cache reconciliation.

use std::sync::Arc;
use std::time::Duration;

use lora_cache::CacheStore;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::devaddr_cache::DevAddrReconciler;
use crate::devaddr_cache::SyncKind;
use crate::registry::DeviceRegistry;

/// Handle to the background reconciliation task.
///
/// The first pass runs immediately, then one per interval. A failed pass is
/// logged and retried on the next tick.
pub struct DevAddrSyncScheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DevAddrSyncScheduler {
    /// Spawn the task on the current runtime at the reconciler's interval.
    pub fn spawn<S, R>(reconciler: Arc<DevAddrReconciler<S, R>>) -> Self
    where
        S: CacheStore + ?Sized + 'static,
        R: DeviceRegistry + ?Sized + 'static,
    {
        let period = reconciler.interval();
        Self::spawn_with_interval(reconciler, period)
    }

    /// Spawn the task with an explicit interval.
    pub fn spawn_with_interval<S, R>(reconciler: Arc<DevAddrReconciler<S, R>>, period: Duration) -> Self
    where
        S: CacheStore + ?Sized + 'static,
        R: DeviceRegistry + ?Sized + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sync_loop(reconciler, period, cancel.clone()));
        Self { cancel, handle }
    }

    /// Token that stops the task when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the task and wait for an in-flight pass to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "address sync task ended abnormally");
        }
    }
}

async fn run_sync_loop<S, R>(reconciler: Arc<DevAddrReconciler<S, R>>, period: Duration, cancel: CancellationToken)
where
    S: CacheStore + ?Sized + 'static,
    R: DeviceRegistry + ?Sized + 'static,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_secs = period.as_secs(), "address sync task started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("address sync task shutting down");
                break;
            }
            _ = ticker.tick() => {
                match reconciler.perform_needed_syncs().await {
                    Ok(report) if report.kind == SyncKind::Skipped => debug!("address sync skipped"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "address sync failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use lora_cache::CacheStoreExt;
    use lora_cache::DeterministicCacheStore;

    use super::*;
    use crate::config::CoordinationConfig;
    use crate::keys;
    use crate::registry::InMemoryRegistry;
    use crate::registry::RegisteredDevice;
    use crate::types::DevAddr;
    use crate::types::DevAddrBucket;
    use crate::types::DevEui;

    #[tokio::test(start_paused = true)]
    async fn test_first_pass_runs_immediately() {
        let store = DeterministicCacheStore::new();
        let registry = InMemoryRegistry::new(10);
        registry.upsert(RegisteredDevice::new(DevEui(1), "k").with_dev_addr(DevAddr(0x11))).await;
        let reconciler = Arc::new(DevAddrReconciler::new(store.clone(), registry, &CoordinationConfig::default()));

        let scheduler = DevAddrSyncScheduler::spawn(reconciler);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(store.key_exists(keys::FULL_UPDATE_KEY).await.unwrap());
        let bucket: Option<DevAddrBucket> = store.object_get(&keys::devaddr_bucket(DevAddr(0x11))).await.unwrap();
        assert_eq!(bucket.unwrap().entries().len(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pass_retried_next_tick() {
        let store = DeterministicCacheStore::new();
        let registry = InMemoryRegistry::new(10);
        registry.set_unavailable(true);
        let reconciler = Arc::new(DevAddrReconciler::new(
            store.clone(),
            registry.clone(),
            &CoordinationConfig::default(),
        ));

        let scheduler = DevAddrSyncScheduler::spawn_with_interval(reconciler, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!store.key_exists(keys::FULL_UPDATE_KEY).await.unwrap());

        registry.set_unavailable(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(store.key_exists(keys::FULL_UPDATE_KEY).await.unwrap());
        assert_eq!(registry.call_counts().list_devices, 2);
        scheduler.shutdown().await;
    }
}
