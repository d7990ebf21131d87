//! Background reconciliation of in-flight split operations.
//!
//! A split that keeps its tenants in `Block` without a decision makes them
//! unavailable. The manager aborts operations whose blocking phase has made
//! no persisted progress for longer than the decision timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::document::{AbortCode, AbortReason, SplitState};
use crate::donor::{DonorService, OperationStatus};
use crate::error::DonorError;
use crate::op_time::unix_time_ms;

/// Configuration for the background split manager.
#[derive(Clone, Copy, Debug)]
pub struct SplitManagerConfig {
    /// Evaluate in-flight operations at this interval.
    pub interval: Duration,
    /// Abort a split stuck in `Blocking` for longer than this. Set to 0 to
    /// disable.
    pub decision_timeout: Duration,
}

impl Default for SplitManagerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            decision_timeout: Duration::ZERO,
        }
    }
}

/// Spawn the split manager. Runs until `shutdown` is cancelled.
pub fn spawn(
    service: Arc<DonorService>,
    cfg: SplitManagerConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            reconcile_once(&service, cfg).await;
        }
    })
}

async fn reconcile_once(service: &Arc<DonorService>, cfg: SplitManagerConfig) {
    let now_ms = unix_time_ms();
    for op in service.list_operations().await {
        let Some(reason) = plan_stalled_split(&op, cfg.decision_timeout, now_ms) else {
            continue;
        };
        match service
            .abort(op.id, "abort stalled split", &[SplitState::Blocking], reason)
            .await
        {
            Ok(_) => {}
            // A decision raced the timeout; nothing to do.
            Err(DonorError::InvalidState { .. }) => {}
            Err(err) => {
                tracing::warn!(operation_id = %op.id, error = %err, "split manager abort failed");
            }
        }
    }
}

/// Abort reason for a split whose blocking phase exceeded `decision_timeout`.
pub fn plan_stalled_split(
    op: &OperationStatus,
    decision_timeout: Duration,
    now_ms: u64,
) -> Option<AbortReason> {
    if decision_timeout.is_zero() || op.state != SplitState::Blocking {
        return None;
    }
    let timeout_ms = decision_timeout.as_millis().min(u128::from(u64::MAX)) as u64;
    let last_progress = op.last_progress_unix_ms.max(op.started_unix_ms);
    if last_progress == 0 {
        return None;
    }
    let idle_ms = now_ms.saturating_sub(last_progress);
    if idle_ms < timeout_ms {
        return None;
    }
    tracing::warn!(
        operation_id = %op.id,
        tenants = op.tenant_ids.len(),
        idle_ms,
        timeout_ms,
        "aborting split stalled in blocking"
    );
    Some(AbortReason {
        code: AbortCode::TimedOut,
        message: format!("no decision after {idle_ms}ms of blocking"),
    })
}
