//! Donor state machine for shard-split operations.
//!
//! Lifecycle:
//! 1. `start_operation` persists the document in `Splitting` and enrolls its tenants
//! 2. `begin_blocking` stamps `block_op_time` and installs `Block` gates
//! 3. `decide` stamps `commit_op_time` (gates move to `Reject`) or records an
//!    abort (gates are released)
//! 4. `mark_garbage_collectable` stamps `expire_at` once the outcome is acknowledged
//! 5. the garbage collector drops the gates and deletes the record
//!
//! Every transition is persisted before its gate effect becomes visible, so a
//! crash at any point is repaired by recovery from the persisted markers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::access_blocker::{Access, AccessKind, BlockerRegistry};
use crate::document::{
    parse_tenant_set, AbortReason, Decision, OperationId, SplitDocument, SplitState, TenantId,
};
use crate::error::{DonorError, DonorResult};
use crate::failpoint::{FailPoints, PAUSE_AFTER_BLOCKING, PAUSE_AFTER_DECISION};
use crate::op_time::{unix_time_ms, OpTime, OpTimeClock};
use crate::store::DocumentStore;

/// Default delay between `mark_garbage_collectable` and record deletion.
pub const DEFAULT_GC_DELAY: Duration = Duration::from_secs(15 * 60);

/// What recovery does with an operation found in `Splitting`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SplittingRecoveryPolicy {
    /// Keep the operation in `Splitting`; it continues as if newly started.
    #[default]
    Resume,
    /// Persist an abort with `InterruptedByRestart`.
    Abort,
}

#[derive(Clone, Debug)]
pub struct DonorConfig {
    /// Replica term stamped into new markers. Recovery raises it to the
    /// highest term found on disk.
    pub term: u64,
    pub gc_delay: Duration,
    /// Expire immediately and wake the collector on `mark_garbage_collectable`.
    pub quick_gc: bool,
    pub splitting_recovery: SplittingRecoveryPolicy,
}

impl Default for DonorConfig {
    fn default() -> Self {
        Self {
            term: 1,
            gc_delay: DEFAULT_GC_DELAY,
            quick_gc: false,
            splitting_recovery: SplittingRecoveryPolicy::Resume,
        }
    }
}

/// Outcome passed to the decision point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Commit,
    Abort(AbortReason),
}

/// Externally visible view of one operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub id: OperationId,
    pub state: SplitState,
    pub tenant_ids: BTreeSet<TenantId>,
    pub recipient_set_name: Option<String>,
    pub block_op_time: Option<OpTime>,
    pub commit_op_time: Option<OpTime>,
    pub abort_reason: Option<AbortReason>,
    pub expire_at_unix_ms: Option<u64>,
    pub started_unix_ms: u64,
    pub last_progress_unix_ms: u64,
    pub decision: String,
}

impl From<&SplitDocument> for OperationStatus {
    fn from(doc: &SplitDocument) -> Self {
        Self {
            id: doc.id,
            state: doc.state,
            tenant_ids: doc.tenant_ids.clone(),
            recipient_set_name: doc.recipient_set_name.clone(),
            block_op_time: doc.block_op_time,
            commit_op_time: doc.commit_op_time,
            abort_reason: doc.abort_reason.clone(),
            expire_at_unix_ms: doc.expire_at_unix_ms,
            started_unix_ms: doc.started_unix_ms,
            last_progress_unix_ms: doc.last_progress_unix_ms,
            decision: doc.decision().as_str().to_string(),
        }
    }
}

/// Result of one garbage-collection sweep.
#[derive(Debug, Default)]
pub struct GcSweep {
    pub collected: Vec<OperationId>,
    pub failed: Vec<(OperationId, DonorError)>,
}

/// Single-writer holder for one operation's document.
#[derive(Debug)]
pub(crate) struct SplitOperation {
    doc: Arc<tokio::sync::Mutex<SplitDocument>>,
    decision: watch::Sender<Decision>,
}

impl SplitOperation {
    pub(crate) fn new(doc: SplitDocument) -> Arc<Self> {
        let (decision, _) = watch::channel(doc.decision());
        Arc::new(Self {
            doc: Arc::new(tokio::sync::Mutex::new(doc)),
            decision,
        })
    }
}

pub struct DonorService {
    pub(crate) config: DonorConfig,
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) clock: OpTimeClock,
    pub(crate) blockers: BlockerRegistry,
    pub(crate) failpoints: Arc<FailPoints>,
    pub(crate) operations: RwLock<BTreeMap<OperationId, Arc<SplitOperation>>>,
    /// Tenant -> operation that currently owns it. Held until the owning
    /// record is garbage collected.
    pub(crate) enrollment: Mutex<HashMap<TenantId, OperationId>>,
    gc_wake: Notify,
}

impl std::fmt::Debug for DonorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DonorService")
            .field("config", &self.config)
            .field("operations", &self.operations.read().len())
            .finish()
    }
}

impl DonorService {
    /// Empty service. Only recovery constructs one, so no caller can observe
    /// a service whose gates were not rebuilt from disk.
    pub(crate) fn empty(
        config: DonorConfig,
        store: Arc<dyn DocumentStore>,
        failpoints: Arc<FailPoints>,
        clock: OpTimeClock,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            blockers: BlockerRegistry::new(),
            failpoints,
            operations: RwLock::new(BTreeMap::new()),
            enrollment: Mutex::new(HashMap::new()),
            gc_wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &DonorConfig {
        &self.config
    }

    pub fn blockers(&self) -> &BlockerRegistry {
        &self.blockers
    }

    pub fn failpoints(&self) -> &Arc<FailPoints> {
        &self.failpoints
    }

    pub fn clock(&self) -> &OpTimeClock {
        &self.clock
    }

    pub(crate) fn gc_wake(&self) -> &Notify {
        &self.gc_wake
    }

    fn operation(&self, id: OperationId) -> DonorResult<Arc<SplitOperation>> {
        self.operations
            .read()
            .get(&id)
            .cloned()
            .ok_or(DonorError::OperationNotFound(id))
    }

    /// Create an operation in `Splitting` for `tenants`.
    pub async fn start_operation<S: AsRef<str>>(
        self: &Arc<Self>,
        tenants: &[S],
        recipient_set_name: Option<String>,
    ) -> DonorResult<OperationStatus> {
        let tenant_ids = parse_tenant_set(tenants)?;
        let mut doc = SplitDocument::new(tenant_ids, recipient_set_name, unix_time_ms());
        doc.state = SplitState::Splitting;
        doc.validate()?;

        // Enrollment and the durable insert finish together even if the
        // caller stops waiting.
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.enroll(doc))
            .await
            .map_err(DonorError::persistence)?
    }

    fn enroll(&self, doc: SplitDocument) -> DonorResult<OperationStatus> {
        self.reserve_tenants(&doc)?;
        if let Err(err) = self.store.insert(&doc) {
            self.release_tenants(doc.id, &doc.tenant_ids);
            tracing::warn!(operation_id = %doc.id, error = %err, "failed to persist new split operation");
            return Err(err);
        }

        let status = OperationStatus::from(&doc);
        tracing::info!(
            operation_id = %doc.id,
            tenants = doc.tenant_ids.len(),
            recipient = doc.recipient_set_name.as_deref().unwrap_or(""),
            "split operation started"
        );
        self.operations
            .write()
            .insert(doc.id, SplitOperation::new(doc));
        Ok(status)
    }

    /// Claim every tenant of `doc` for its operation, or none of them if any
    /// is already owned. The claim blocks overlapping starts while the
    /// record is being written.
    fn reserve_tenants(&self, doc: &SplitDocument) -> DonorResult<()> {
        let mut enrollment = self.enrollment.lock();
        for tenant in &doc.tenant_ids {
            if let Some(owner) = enrollment.get(tenant) {
                tracing::info!(
                    tenant_id = %tenant,
                    owner = %owner,
                    "rejecting split start for enrolled tenant"
                );
                return Err(DonorError::ConflictingOperation {
                    tenant_id: tenant.clone(),
                    operation_id: *owner,
                });
            }
        }
        for tenant in &doc.tenant_ids {
            enrollment.insert(tenant.clone(), doc.id);
        }
        Ok(())
    }

    fn release_tenants(&self, id: OperationId, tenants: &BTreeSet<TenantId>) {
        let mut enrollment = self.enrollment.lock();
        for tenant in tenants {
            if enrollment.get(tenant) == Some(&id) {
                enrollment.remove(tenant);
            }
        }
    }

    /// `Splitting -> Blocking`: stamp `block_op_time`, then gate every tenant.
    pub async fn begin_blocking(self: &Arc<Self>, id: OperationId) -> DonorResult<OperationStatus> {
        self.transition(
            id,
            "begin blocking",
            &[SplitState::Splitting],
            |doc| {
                doc.state = SplitState::Blocking;
                doc.block_op_time = Some(self.clock.tick());
            },
            |blockers, doc| match doc.block_op_time {
                Some(block) => blockers.install_block(doc.id, &doc.tenant_ids, block),
                None => Err(DonorError::integrity(
                    format!("operation {}", doc.id),
                    "blocking without block_op_time",
                )),
            },
        )
        .await
    }

    /// The decision point. Only valid from `Blocking`.
    pub async fn decide(
        self: &Arc<Self>,
        id: OperationId,
        outcome: Outcome,
    ) -> DonorResult<OperationStatus> {
        match outcome {
            Outcome::Commit => {
                self.transition(
                    id,
                    "commit",
                    &[SplitState::Blocking],
                    |doc| {
                        doc.state = SplitState::Committed;
                        doc.commit_op_time = Some(self.clock.tick());
                    },
                    |blockers, doc| blockers.reject(doc.id, &doc.tenant_ids),
                )
                .await
            }
            Outcome::Abort(reason) => self.abort(id, "abort", &[SplitState::Blocking], reason).await,
        }
    }

    /// Abort from `Splitting` or `Blocking`. A committed operation cannot be
    /// abandoned.
    pub async fn abandon(
        self: &Arc<Self>,
        id: OperationId,
        reason: impl Into<String>,
    ) -> DonorResult<OperationStatus> {
        self.abort(
            id,
            "abandon",
            &[SplitState::Splitting, SplitState::Blocking],
            AbortReason::requested(reason),
        )
        .await
    }

    pub(crate) async fn abort(
        self: &Arc<Self>,
        id: OperationId,
        action: &'static str,
        allowed: &[SplitState],
        reason: AbortReason,
    ) -> DonorResult<OperationStatus> {
        self.transition(
            id,
            action,
            allowed,
            |doc| {
                doc.state = SplitState::Aborted;
                doc.abort_reason = Some(reason);
            },
            |blockers, doc| {
                blockers.allow_and_remove(doc.id, &doc.tenant_ids);
                Ok(())
            },
        )
        .await
    }

    /// Stamp `expire_at` on a decided operation. Repeating the call on an
    /// operation that is already collectable leaves it untouched.
    pub async fn mark_garbage_collectable(
        self: &Arc<Self>,
        id: OperationId,
    ) -> DonorResult<OperationStatus> {
        let delay_ms = if self.config.quick_gc {
            0
        } else {
            self.config.gc_delay.as_millis().min(u128::from(u64::MAX)) as u64
        };
        let res = self
            .transition(
                id,
                "mark garbage collectable",
                &[SplitState::Committed, SplitState::Aborted],
                |doc| {
                    doc.state = SplitState::GarbageCollectable;
                    doc.expire_at_unix_ms = Some(unix_time_ms().saturating_add(delay_ms));
                },
                |_, _| Ok(()),
            )
            .await;
        let status = match res {
            Ok(status) => status,
            Err(DonorError::InvalidState {
                state: SplitState::GarbageCollectable,
                ..
            }) => return self.operation_status(id).await,
            Err(err) => return Err(err),
        };
        if self.config.quick_gc {
            self.gc_wake.notify_one();
        }
        Ok(status)
    }

    pub async fn operation_status(&self, id: OperationId) -> DonorResult<OperationStatus> {
        let op = self.operation(id)?;
        let doc = op.doc.lock().await;
        Ok(OperationStatus::from(&*doc))
    }

    pub async fn list_operations(&self) -> Vec<OperationStatus> {
        let ops: Vec<Arc<SplitOperation>> = self.operations.read().values().cloned().collect();
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            out.push(OperationStatus::from(&*op.doc.lock().await));
        }
        out
    }

    /// Wait until the operation records a commit or abort decision.
    ///
    /// Cancellation returns `Decision::Undecided`; an elapsed `timeout`
    /// returns `OperationTimedOut`. Neither affects the operation.
    pub async fn wait_for_decision(
        &self,
        id: OperationId,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> DonorResult<Decision> {
        let mut rx = self.operation(id)?.decision.subscribe();
        let started = Instant::now();
        let decided = async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if current.is_decided() {
                    return current;
                }
                if rx.changed().await.is_err() {
                    // Operation was collected; report the last published value.
                    return rx.borrow().clone();
                }
            }
        };
        let bounded = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, decided).await.map_err(|_| {
                    DonorError::OperationTimedOut {
                        what: format!("decision of split operation {id}"),
                        waited_ms: started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
                    }
                }),
                None => Ok(decided.await),
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(Decision::Undecided),
            res = bounded => res,
        }
    }

    /// Admission check for tenant-scoped traffic.
    pub fn check_access(&self, tenant: &str, kind: AccessKind) -> DonorResult<Access> {
        let tenant = TenantId::parse(tenant)?;
        self.blockers.check_access(&tenant, kind)
    }

    /// Admission check that waits out a `Block` gate for at most `timeout`.
    pub async fn wait_for_access(
        &self,
        tenant: &str,
        kind: AccessKind,
        timeout: Duration,
    ) -> DonorResult<()> {
        let tenant = TenantId::parse(tenant)?;
        self.blockers.wait_for_access(&tenant, kind, timeout).await
    }

    /// Drive an operation to a commit decision in the background.
    ///
    /// Returns once the request is accepted; the handle resolves when the
    /// driver finishes. Pauses at [`PAUSE_AFTER_BLOCKING`] and
    /// [`PAUSE_AFTER_DECISION`] when those failpoints are enabled.
    pub async fn commit_async(
        self: &Arc<Self>,
        id: OperationId,
    ) -> DonorResult<JoinHandle<DonorResult<OperationStatus>>> {
        let state = self.operation_status(id).await?.state;
        if !matches!(state, SplitState::Splitting | SplitState::Blocking) {
            return Err(DonorError::invalid_state(id, state, "commit"));
        }
        let service = self.clone();
        Ok(tokio::spawn(async move {
            let res = service.drive_commit(id, state).await;
            if let Err(err) = &res {
                tracing::warn!(operation_id = %id, error = %err, "split commit driver failed");
            }
            res
        }))
    }

    async fn drive_commit(self: &Arc<Self>, id: OperationId, from: SplitState) -> DonorResult<OperationStatus> {
        if from == SplitState::Splitting {
            self.begin_blocking(id).await?;
        }
        self.failpoints.hit(PAUSE_AFTER_BLOCKING).await;
        let status = self.decide(id, Outcome::Commit).await?;
        self.failpoints.hit(PAUSE_AFTER_DECISION).await;
        tracing::info!(operation_id = %id, "split commit driver finished");
        Ok(status)
    }

    /// Delete every collectable operation whose `expire_at` has passed.
    pub async fn collect_expired(self: &Arc<Self>, now_ms: u64) -> GcSweep {
        let candidates: Vec<(OperationId, Arc<SplitOperation>)> = self
            .operations
            .read()
            .iter()
            .map(|(id, op)| (*id, op.clone()))
            .collect();
        let mut sweep = GcSweep::default();
        for (id, op) in candidates {
            let doc = op.doc.clone().lock_owned().await;
            if !doc.is_expired(now_ms) {
                continue;
            }
            let service = self.clone();
            let res = tokio::task::spawn_blocking(move || service.delete_expired(id, &doc))
                .await
                .map_err(DonorError::persistence)
                .and_then(|res| res);
            match res {
                Ok(()) => sweep.collected.push(id),
                Err(err) => sweep.failed.push((id, err)),
            }
        }
        sweep
    }

    fn delete_expired(&self, id: OperationId, doc: &SplitDocument) -> DonorResult<()> {
        let removed = self.blockers.remove_for_operation(id, &doc.tenant_ids);
        if let Err(err) = self.store.remove(id) {
            self.blockers.restore(removed);
            tracing::warn!(operation_id = %id, error = %err, "failed to delete expired split operation");
            return Err(err);
        }
        self.operations.write().remove(&id);
        self.release_tenants(id, &doc.tenant_ids);
        tracing::info!(
            operation_id = %id,
            decision = doc.decision().as_str(),
            "garbage collected split operation"
        );
        Ok(())
    }

    /// Apply one persisted transition under the operation's writer lock.
    ///
    /// The durable write, the in-memory swap and the gate effect run on the
    /// blocking pool and complete together even if the caller stops waiting.
    async fn transition<E>(
        self: &Arc<Self>,
        id: OperationId,
        action: &'static str,
        allowed: &[SplitState],
        apply: impl FnOnce(&mut SplitDocument),
        effect: E,
    ) -> DonorResult<OperationStatus>
    where
        E: FnOnce(&BlockerRegistry, &SplitDocument) -> DonorResult<()> + Send + 'static,
    {
        let op = self.operation(id)?;
        let mut current = op.doc.clone().lock_owned().await;
        if !allowed.contains(&current.state) {
            return Err(DonorError::invalid_state(id, current.state, action));
        }
        let from = current.state;
        let mut next = current.clone();
        apply(&mut next);
        next.last_progress_unix_ms = unix_time_ms();
        next.validate()?;

        let service = self.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = service.store.update_if_state(&next, from) {
                tracing::warn!(
                    operation_id = %id,
                    action,
                    state = %from,
                    error = %err,
                    "failed to persist split transition"
                );
                return Err(err);
            }
            *current = next;

            let res = effect(&service.blockers, &*current);
            op.decision.send_replace(current.decision());
            if let Err(err) = res {
                // The record is already durable; recovery rebuilds the gates from it.
                tracing::error!(operation_id = %id, action, error = %err, "split gate update failed");
                return Err(err);
            }
            tracing::info!(
                operation_id = %id,
                from = %from,
                to = %current.state,
                block_op_time = ?current.block_op_time,
                commit_op_time = ?current.commit_op_time,
                "split operation transitioned"
            );
            Ok(OperationStatus::from(&*current))
        })
        .await
        .map_err(DonorError::persistence)?
    }
}
