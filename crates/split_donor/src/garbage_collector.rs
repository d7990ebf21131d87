//! Background deletion of expired split operations.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::donor::DonorService;
use crate::op_time::unix_time_ms;

/// Configuration for the background collector.
#[derive(Clone, Copy, Debug)]
pub struct GarbageCollectorConfig {
    /// Sweep at this interval. Quick garbage collection also wakes the
    /// collector as soon as an operation is marked.
    pub interval: Duration,
}

impl Default for GarbageCollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// Spawn the background collector. Runs until `shutdown` is cancelled.
pub fn spawn(
    service: Arc<DonorService>,
    cfg: GarbageCollectorConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = service.gc_wake().notified() => {}
            }
            let sweep = service.collect_expired(unix_time_ms()).await;
            if !sweep.collected.is_empty() || !sweep.failed.is_empty() {
                tracing::debug!(
                    collected = sweep.collected.len(),
                    failed = sweep.failed.len(),
                    "garbage collection sweep finished"
                );
            }
        }
        tracing::debug!("garbage collector stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::donor::{DonorConfig, Outcome};
    use crate::failpoint::FailPoints;
    use crate::store::MemoryDocumentStore;

    #[tokio::test]
    async fn quick_gc_wakes_collector_immediately() {
        let store = MemoryDocumentStore::new();
        let config = DonorConfig {
            quick_gc: true,
            ..DonorConfig::default()
        };
        let (svc, _) =
            DonorService::recover(config, Arc::new(store.clone()), FailPoints::new()).expect("recover");
        let shutdown = CancellationToken::new();
        let handle = spawn(
            svc.clone(),
            GarbageCollectorConfig {
                interval: Duration::from_secs(3600),
            },
            shutdown.clone(),
        );

        let op = svc.start_operation(&["t1"], None).await.expect("start");
        svc.begin_blocking(op.id).await.expect("block");
        svc.decide(op.id, Outcome::Commit).await.expect("commit");
        svc.mark_garbage_collectable(op.id).await.expect("mark");

        tokio::time::timeout(Duration::from_secs(5), async {
            while !store.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("record collected");
        assert!(svc.blockers().is_empty());

        shutdown.cancel();
        handle.await.expect("collector stops");
    }

    #[tokio::test]
    async fn unexpired_operations_survive_sweeps() {
        let store = MemoryDocumentStore::new();
        let (svc, _) = DonorService::recover(
            DonorConfig::default(),
            Arc::new(store.clone()),
            FailPoints::new(),
        )
        .expect("recover");
        let shutdown = CancellationToken::new();
        let handle = spawn(
            svc.clone(),
            GarbageCollectorConfig {
                interval: Duration::from_millis(5),
            },
            shutdown.clone(),
        );

        let op = svc.start_operation(&["t1"], None).await.expect("start");
        svc.abandon(op.id, "operator").await.expect("abandon");
        svc.mark_garbage_collectable(op.id).await.expect("mark");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.len(), 1);

        shutdown.cancel();
        handle.await.expect("collector stops");
    }
}
