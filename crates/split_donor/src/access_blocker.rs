//! Per-tenant access gates consulted before tenant-scoped reads and writes.
//!
//! A blocker moves through `Allow -> Block -> {Reject, Allow}`. State reads are
//! a single atomic load; writers are the donor state machine and the recovery
//! loader, serialized per tenant by the registry lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::document::{OperationId, TenantId};
use crate::error::{DonorError, DonorResult};
use crate::op_time::OpTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessState {
    Allow,
    Block,
    Reject,
}

impl AccessState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Allow => 0,
            Self::Block => 1,
            Self::Reject => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Allow,
            1 => Self::Block,
            _ => Self::Reject,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Reject => "reject",
        }
    }

    fn can_transition_to(self, next: AccessState) -> bool {
        matches!(
            (self, next),
            (Self::Allow, Self::Block) | (Self::Block, Self::Reject) | (Self::Block, Self::Allow)
        )
    }
}

/// Kind of tenant-scoped access being admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Write,
    /// Read at an optional cluster time. Reads strictly before the block
    /// marker cannot observe post-block writes and pass a `Block` gate.
    Read { at: Option<OpTime> },
}

/// Result of an admission check.
#[derive(Debug)]
pub enum Access {
    Allow,
    /// Caller must wait; the blocker wakes waiters on every transition.
    Block(Arc<TenantAccessBlocker>),
}

/// In-memory gate for one tenant. Derived state, never persisted on its own.
#[derive(Debug)]
pub struct TenantAccessBlocker {
    tenant_id: TenantId,
    source_operation_id: OperationId,
    block_op_time: Option<OpTime>,
    state: AtomicU8,
    quarantined: bool,
    changed: Notify,
}

impl TenantAccessBlocker {
    fn new(
        tenant_id: TenantId,
        source_operation_id: OperationId,
        block_op_time: Option<OpTime>,
        state: AccessState,
        quarantined: bool,
    ) -> Self {
        Self {
            tenant_id,
            source_operation_id,
            block_op_time,
            state: AtomicU8::new(state.to_u8()),
            quarantined,
            changed: Notify::new(),
        }
    }

    pub fn state(&self) -> AccessState {
        AccessState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, next: AccessState) -> DonorResult<()> {
        let current = self.state();
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(DonorError::InvalidRequest(format!(
                "access blocker for tenant {} cannot move from {} to {}",
                self.tenant_id,
                current.as_str(),
                next.as_str()
            )));
        }
        self.state.store(next.to_u8(), Ordering::Release);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Evaluate admission against the current state without waiting.
    pub fn check(self: &Arc<Self>, kind: AccessKind) -> DonorResult<Access> {
        if self.quarantined {
            return Err(DonorError::integrity(
                format!("tenant {}", self.tenant_id),
                format!(
                    "tenant is quarantined after unrecoverable split operation {}",
                    self.source_operation_id
                ),
            ));
        }
        match self.state() {
            AccessState::Allow => Ok(Access::Allow),
            AccessState::Reject => Err(DonorError::TenantMigrated {
                tenant_id: self.tenant_id.clone(),
                operation_id: self.source_operation_id,
            }),
            AccessState::Block => match (kind, self.block_op_time) {
                (AccessKind::Read { at: Some(at) }, Some(block)) if at < block => {
                    Ok(Access::Allow)
                }
                _ => Ok(Access::Block(self.clone())),
            },
        }
    }

    /// Wait until the blocker leaves `Block` (or the deadline passes).
    pub async fn wait_for_change(&self, deadline: Instant) -> bool {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register interest before re-reading state so a transition that
            // lands in between is not missed.
            notified.as_mut().enable();
            if self.state() != AccessState::Block {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.state() != AccessState::Block;
            }
        }
    }
}

/// Snapshot row used by status endpoints and tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockerView {
    pub tenant_id: TenantId,
    pub state: AccessState,
    pub source_operation_id: OperationId,
    pub quarantined: bool,
}

/// Registry of blockers keyed by tenant.
#[derive(Debug, Default)]
pub struct BlockerRegistry {
    blockers: RwLock<HashMap<TenantId, Arc<TenantAccessBlocker>>>,
}

impl BlockerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: &TenantId) -> Option<Arc<TenantAccessBlocker>> {
        self.blockers.read().get(tenant_id).cloned()
    }

    /// Access state for a tenant; tenants without a blocker are allowed.
    pub fn access_state(&self, tenant_id: &TenantId) -> AccessState {
        self.get(tenant_id)
            .map(|b| b.state())
            .unwrap_or(AccessState::Allow)
    }

    /// Install `Block` blockers for every tenant of an operation.
    ///
    /// Re-installing for the same operation is a no-op, which lets recovery
    /// and a live transition converge on the same state.
    pub fn install_block(
        &self,
        operation_id: OperationId,
        tenants: &BTreeSet<TenantId>,
        block_op_time: OpTime,
    ) -> DonorResult<()> {
        let mut blockers = self.blockers.write();
        ensure_not_owned_elsewhere(&blockers, operation_id, tenants)?;
        for tenant in tenants {
            if let Some(existing) = blockers.get(tenant) {
                if existing.state() == AccessState::Block {
                    continue;
                }
            }
            // A fresh gate starts at Allow and moves to Block before it is
            // published.
            let blocker = TenantAccessBlocker::new(
                tenant.clone(),
                operation_id,
                Some(block_op_time),
                AccessState::Allow,
                false,
            );
            blocker.transition(AccessState::Block)?;
            blockers.insert(tenant.clone(), Arc::new(blocker));
        }
        Ok(())
    }

    /// Move every tenant of an operation from `Block` to `Reject`.
    pub fn reject(
        &self,
        operation_id: OperationId,
        tenants: &BTreeSet<TenantId>,
    ) -> DonorResult<()> {
        let blockers = self.blockers.read();
        for tenant in tenants {
            let blocker = blockers
                .get(tenant)
                .filter(|b| b.source_operation_id == operation_id)
                .ok_or_else(|| {
                    DonorError::InvalidRequest(format!(
                        "no access blocker for tenant {tenant} owned by {operation_id}"
                    ))
                })?;
            blocker.transition(AccessState::Reject)?;
        }
        Ok(())
    }

    /// Install `Reject` blockers directly. Used by recovery for committed
    /// operations, where the blocking transition already happened.
    pub fn install_reject(
        &self,
        operation_id: OperationId,
        tenants: &BTreeSet<TenantId>,
        block_op_time: Option<OpTime>,
    ) -> DonorResult<()> {
        let mut blockers = self.blockers.write();
        ensure_not_owned_elsewhere(&blockers, operation_id, tenants)?;
        for tenant in tenants {
            let blocker = TenantAccessBlocker::new(
                tenant.clone(),
                operation_id,
                block_op_time,
                AccessState::Reject,
                false,
            );
            blockers.insert(tenant.clone(), Arc::new(blocker));
        }
        Ok(())
    }

    /// Release blocked tenants after an abort and drop their blockers.
    pub fn allow_and_remove(&self, operation_id: OperationId, tenants: &BTreeSet<TenantId>) {
        let mut blockers = self.blockers.write();
        for tenant in tenants {
            let owned = blockers
                .get(tenant)
                .is_some_and(|b| b.source_operation_id == operation_id);
            if !owned {
                continue;
            }
            if let Some(blocker) = blockers.remove(tenant) {
                if blocker.state() == AccessState::Block {
                    let _ = blocker.transition(AccessState::Allow);
                }
            }
        }
    }

    /// Remove an operation's blockers, returning them so a failed caller can
    /// put them back with [`BlockerRegistry::restore`].
    pub fn remove_for_operation(
        &self,
        operation_id: OperationId,
        tenants: &BTreeSet<TenantId>,
    ) -> Vec<Arc<TenantAccessBlocker>> {
        let mut blockers = self.blockers.write();
        let mut removed = Vec::new();
        for tenant in tenants {
            let owned = blockers
                .get(tenant)
                .is_some_and(|b| b.source_operation_id == operation_id);
            if owned {
                if let Some(blocker) = blockers.remove(tenant) {
                    removed.push(blocker);
                }
            }
        }
        removed
    }

    pub fn restore(&self, removed: Vec<Arc<TenantAccessBlocker>>) {
        let mut blockers = self.blockers.write();
        for blocker in removed {
            blockers
                .entry(blocker.tenant_id.clone())
                .or_insert(blocker);
        }
    }

    /// Refuse service for tenants of an operation that failed integrity
    /// checks during recovery.
    pub fn quarantine(&self, operation_id: OperationId, tenants: &BTreeSet<TenantId>) {
        let mut blockers = self.blockers.write();
        for tenant in tenants {
            let blocker = TenantAccessBlocker::new(
                tenant.clone(),
                operation_id,
                None,
                AccessState::Reject,
                true,
            );
            blockers.insert(tenant.clone(), Arc::new(blocker));
        }
    }

    /// Admission check used by the command dispatcher.
    pub fn check_access(&self, tenant_id: &TenantId, kind: AccessKind) -> DonorResult<Access> {
        match self.get(tenant_id) {
            Some(blocker) => blocker.check(kind),
            None => Ok(Access::Allow),
        }
    }

    /// Wait while the tenant is blocked. Returns once access is allowed, fails
    /// with `TenantMigrated` if the gate rejects, or `OperationTimedOut` when
    /// `timeout` elapses first.
    pub async fn wait_for_access(
        &self,
        tenant_id: &TenantId,
        kind: AccessKind,
        timeout: Duration,
    ) -> DonorResult<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            match self.check_access(tenant_id, kind)? {
                Access::Allow => return Ok(()),
                Access::Block(blocker) => {
                    if !blocker.wait_for_change(deadline).await {
                        return Err(DonorError::OperationTimedOut {
                            what: format!("tenant {tenant_id} to be unblocked"),
                            waited_ms: started.elapsed().as_millis().min(u128::from(u64::MAX))
                                as u64,
                        });
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<BlockerView> {
        let blockers = self.blockers.read();
        let mut rows: BTreeMap<TenantId, BlockerView> = BTreeMap::new();
        for (tenant, blocker) in blockers.iter() {
            rows.insert(
                tenant.clone(),
                BlockerView {
                    tenant_id: tenant.clone(),
                    state: blocker.state(),
                    source_operation_id: blocker.source_operation_id,
                    quarantined: blocker.quarantined,
                },
            );
        }
        rows.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.blockers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blockers.read().is_empty()
    }
}

fn ensure_not_owned_elsewhere(
    blockers: &HashMap<TenantId, Arc<TenantAccessBlocker>>,
    operation_id: OperationId,
    tenants: &BTreeSet<TenantId>,
) -> DonorResult<()> {
    for tenant in tenants {
        if let Some(existing) = blockers.get(tenant) {
            if existing.source_operation_id != operation_id {
                return Err(DonorError::ConflictingOperation {
                    tenant_id: tenant.clone(),
                    operation_id: existing.source_operation_id,
                });
            }
        }
    }
    Ok(())
}
