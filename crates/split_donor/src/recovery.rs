//! Startup recovery of split operations.
//!
//! Recovery runs once, before the service exists, and rebuilds every tenant
//! gate from the persisted markers alone:
//! - commit marker: gate in `Reject`
//! - abort marker: no gate
//! - block marker only: gate in `Block`, operation awaits a decision
//! - no marker: operation is `Splitting`, handled by [`SplittingRecoveryPolicy`]
//!
//! Records that fail validation are not loaded. Their tenants are quarantined
//! so traffic fails with `IntegrityViolation` instead of being served from a
//! guessed state.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::document::{AbortCode, AbortReason, OperationId, SplitDocument, SplitState, TenantId};
use crate::donor::{DonorConfig, DonorService, SplitOperation, SplittingRecoveryPolicy};
use crate::error::{DonorError, DonorResult};
use crate::failpoint::FailPoints;
use crate::op_time::{unix_time_ms, OpTimeClock};
use crate::store::DocumentStore;

/// What recovery did with one persisted operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Commit marker present; gates reinstalled in `Reject`.
    RejectInstalled,
    /// Block marker present; gates reinstalled in `Block`.
    BlockInstalled,
    /// Abort recorded; tenants are left ungated.
    Released,
    /// No markers; operation continues from `Splitting`.
    ResumedSplitting,
    /// No markers; abort persisted because of the configured policy.
    AbortedSplitting,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecoveredOperation {
    pub id: OperationId,
    pub state: SplitState,
    pub action: RecoveryAction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryViolation {
    /// Storage key of the offending record.
    pub key: String,
    pub error: DonorError,
    pub quarantined: BTreeSet<TenantId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: Vec<RecoveredOperation>,
    pub violations: Vec<RecoveryViolation>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Action recovery took for `id`, if it was loaded.
    pub fn action_for(&self, id: OperationId) -> Option<RecoveryAction> {
        self.recovered
            .iter()
            .find(|op| op.id == id)
            .map(|op| op.action)
    }
}

impl DonorService {
    /// Load persisted operations and build the service.
    ///
    /// Fails only when the store cannot be listed. Invalid records are
    /// reported in [`RecoveryReport::violations`] and their tenants
    /// quarantined.
    pub fn recover(
        config: DonorConfig,
        store: Arc<dyn DocumentStore>,
        failpoints: Arc<FailPoints>,
    ) -> DonorResult<(Arc<Self>, RecoveryReport)> {
        let records = store.list()?;
        let mut report = RecoveryReport::default();

        let mut docs = Vec::with_capacity(records.len());
        for record in records {
            match record.document {
                Ok(doc) => match doc.validate() {
                    Ok(()) => docs.push(doc),
                    Err(error) => report.violations.push(RecoveryViolation {
                        key: record.key,
                        error,
                        quarantined: doc.tenant_ids,
                    }),
                },
                // An unreadable body has no trustworthy tenant set.
                Err(error) => report.violations.push(RecoveryViolation {
                    key: record.key,
                    error,
                    quarantined: BTreeSet::new(),
                }),
            }
        }
        // Earlier operations win tenant ownership; ties break on id.
        docs.sort_by_key(|doc| (doc.started_unix_ms, doc.id));

        let term = docs
            .iter()
            .flat_map(|doc| [doc.block_op_time, doc.commit_op_time])
            .flatten()
            .map(|t| t.term)
            .fold(config.term, u64::max);
        let clock = OpTimeClock::new(term);
        for doc in &docs {
            for marker in [doc.block_op_time, doc.commit_op_time].into_iter().flatten() {
                clock.observe(marker);
            }
        }

        let policy = config.splitting_recovery;
        let service = DonorService::empty(config, store, failpoints, clock);

        for violation in &report.violations {
            service.quarantine_record(&violation.key, &violation.quarantined);
        }

        for doc in docs {
            let conflict = {
                let enrollment = service.enrollment.lock();
                doc.tenant_ids
                    .iter()
                    .find_map(|t| enrollment.get(t).map(|owner| (t.clone(), *owner)))
            };
            if let Some((tenant, owner)) = conflict {
                let error = DonorError::integrity(
                    format!("operation {}", doc.id),
                    format!("tenant {tenant} is also enrolled in operation {owner}"),
                );
                let enrollment = service.enrollment.lock();
                let quarantined: BTreeSet<TenantId> = doc
                    .tenant_ids
                    .iter()
                    .filter(|t| !enrollment.contains_key(*t))
                    .cloned()
                    .collect();
                drop(enrollment);
                let key = doc.id.to_string();
                service.quarantine_record(&key, &quarantined);
                report.violations.push(RecoveryViolation {
                    key,
                    error,
                    quarantined,
                });
                continue;
            }

            match service.restore_operation(doc, policy) {
                Ok(recovered) => report.recovered.push(recovered),
                Err((doc, error)) => {
                    let key = doc.id.to_string();
                    service.quarantine_record(&key, &doc.tenant_ids);
                    report.violations.push(RecoveryViolation {
                        key,
                        error,
                        quarantined: doc.tenant_ids,
                    });
                }
            }
        }

        for violation in &report.violations {
            tracing::warn!(
                key = %violation.key,
                error = %violation.error,
                quarantined = violation.quarantined.len(),
                "split operation failed recovery"
            );
        }
        tracing::info!(
            recovered = report.recovered.len(),
            violations = report.violations.len(),
            term = service.clock.term(),
            "split donor recovery complete"
        );
        Ok((Arc::new(service), report))
    }

    fn quarantine_record(&self, key: &str, tenants: &BTreeSet<TenantId>) {
        if tenants.is_empty() {
            return;
        }
        // Unparseable keys still need an owner id for the gates.
        let owner = key.parse().unwrap_or_default();
        self.blockers.quarantine(owner, tenants);
        let mut enrollment = self.enrollment.lock();
        for tenant in tenants {
            enrollment.insert(tenant.clone(), owner);
        }
    }

    fn restore_operation(
        &self,
        mut doc: SplitDocument,
        policy: SplittingRecoveryPolicy,
    ) -> Result<RecoveredOperation, (SplitDocument, DonorError)> {
        let id = doc.id;
        let action = if doc.commit_op_time.is_some() {
            if let Err(err) = self
                .blockers
                .install_reject(id, &doc.tenant_ids, doc.block_op_time)
            {
                return Err((doc, err));
            }
            RecoveryAction::RejectInstalled
        } else if doc.abort_reason.is_some() {
            RecoveryAction::Released
        } else if let Some(block) = doc.block_op_time {
            if let Err(err) = self.blockers.install_block(id, &doc.tenant_ids, block) {
                return Err((doc, err));
            }
            RecoveryAction::BlockInstalled
        } else {
            match policy {
                SplittingRecoveryPolicy::Resume => RecoveryAction::ResumedSplitting,
                SplittingRecoveryPolicy::Abort => {
                    let mut aborted = doc.clone();
                    aborted.state = SplitState::Aborted;
                    aborted.abort_reason = Some(AbortReason {
                        code: AbortCode::InterruptedByRestart,
                        message: "split was interrupted by a restart before blocking".into(),
                    });
                    aborted.last_progress_unix_ms = unix_time_ms();
                    match self.store.update_if_state(&aborted, SplitState::Splitting) {
                        Ok(()) => {
                            doc = aborted;
                            RecoveryAction::AbortedSplitting
                        }
                        Err(err) => {
                            // Still consistent on disk; retry on the next restart.
                            tracing::warn!(
                                operation_id = %id,
                                error = %err,
                                "failed to abort interrupted split, resuming instead"
                            );
                            RecoveryAction::ResumedSplitting
                        }
                    }
                }
            }
        };

        {
            let mut enrollment = self.enrollment.lock();
            for tenant in &doc.tenant_ids {
                enrollment.insert(tenant.clone(), id);
            }
        }
        let recovered = RecoveredOperation {
            id,
            state: doc.state,
            action,
        };
        tracing::info!(
            operation_id = %id,
            state = %doc.state,
            action = ?action,
            block_op_time = ?doc.block_op_time,
            commit_op_time = ?doc.commit_op_time,
            "recovered split operation"
        );
        self.operations.write().insert(id, SplitOperation::new(doc));
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_blocker::{AccessKind, AccessState};
    use crate::donor::Outcome;
    use crate::op_time::OpTime;
    use crate::store::{encode_record, MemoryDocumentStore};

    fn recover(store: &MemoryDocumentStore, config: DonorConfig) -> (Arc<DonorService>, RecoveryReport) {
        DonorService::recover(config, Arc::new(store.clone()), FailPoints::new()).expect("recover")
    }

    fn tenant(name: &str) -> TenantId {
        TenantId::parse(name).expect("tenant")
    }

    fn gates(svc: &DonorService, tenants: &[&str]) -> Vec<AccessState> {
        tenants
            .iter()
            .map(|t| svc.blockers().access_state(&tenant(t)))
            .collect()
    }

    #[tokio::test]
    async fn crash_while_blocking_restores_block_gates() {
        let store = MemoryDocumentStore::new();
        let (svc, _) = recover(&store, DonorConfig::default());
        let op = svc.start_operation(&["t1", "t2"], None).await.expect("start");
        svc.begin_blocking(op.id).await.expect("block");
        drop(svc);

        let (svc, report) = recover(&store, DonorConfig::default());
        assert!(report.is_clean());
        assert_eq!(report.action_for(op.id), Some(RecoveryAction::BlockInstalled));
        assert_eq!(gates(&svc, &["t1", "t2"]), vec![AccessState::Block; 2]);

        // The resumed operation still reaches a decision.
        let committed = svc.decide(op.id, Outcome::Commit).await.expect("commit");
        assert!(committed.commit_op_time > committed.block_op_time);
    }

    #[tokio::test]
    async fn crash_after_commit_restores_reject_gates() {
        let store = MemoryDocumentStore::new();
        let (svc, _) = recover(&store, DonorConfig::default());
        let op = svc.start_operation(&["t1", "t2"], None).await.expect("start");
        svc.begin_blocking(op.id).await.expect("block");
        svc.decide(op.id, Outcome::Commit).await.expect("commit");
        drop(svc);

        let (svc, report) = recover(&store, DonorConfig::default());
        assert_eq!(report.action_for(op.id), Some(RecoveryAction::RejectInstalled));
        assert_eq!(gates(&svc, &["t1", "t2"]), vec![AccessState::Reject; 2]);
        let status = svc.operation_status(op.id).await.expect("status");
        assert_eq!(status.state, SplitState::Committed);
        let block = status.block_op_time.expect("block marker");
        let commit = status.commit_op_time.expect("commit marker");
        assert!(commit >= block);
        let err = svc.check_access("t1", AccessKind::Write).expect_err("migrated");
        assert_eq!(err.code(), "TENANTMIGRATED");

        // Forgetting after the restart is still possible.
        svc.mark_garbage_collectable(op.id).await.expect("mark");
    }

    #[tokio::test]
    async fn repeated_restarts_rebuild_identical_gates() {
        let store = MemoryDocumentStore::new();
        let (svc, _) = recover(&store, DonorConfig::default());
        let blocked = svc.start_operation(&["a1"], None).await.expect("start");
        svc.begin_blocking(blocked.id).await.expect("block");
        let committed = svc.start_operation(&["b1"], None).await.expect("start");
        svc.begin_blocking(committed.id).await.expect("block");
        svc.decide(committed.id, Outcome::Commit).await.expect("commit");
        let aborted = svc.start_operation(&["c1"], None).await.expect("start");
        svc.abandon(aborted.id, "operator").await.expect("abandon");
        svc.start_operation(&["d1"], None).await.expect("start");
        drop(svc);

        let (first, first_report) = recover(&store, DonorConfig::default());
        let snapshot = first.blockers().snapshot();
        drop(first);
        for _ in 0..3 {
            let (svc, report) = recover(&store, DonorConfig::default());
            assert_eq!(svc.blockers().snapshot(), snapshot);
            assert_eq!(report, first_report);
        }
        assert_eq!(
            snapshot.iter().map(|b| b.state).collect::<Vec<_>>(),
            vec![AccessState::Block, AccessState::Reject]
        );
    }

    #[tokio::test]
    async fn commit_marker_after_restart_orders_after_block_marker() {
        let store = MemoryDocumentStore::new();
        let (svc, _) = recover(&store, DonorConfig::default());
        let op = svc.start_operation(&["t1"], None).await.expect("start");
        drop(svc);

        // Block marker stamped in the future under a higher term.
        let mut doc = store.get(op.id).expect("get").expect("record");
        doc.state = SplitState::Blocking;
        doc.block_op_time = Some(OpTime::new(7, unix_time_ms() + 60_000));
        store.put_raw(op.id, encode_record(&doc).expect("encode"));

        let (svc, _) = recover(&store, DonorConfig::default());
        assert_eq!(svc.clock().term(), 7);
        let committed = svc.decide(op.id, Outcome::Commit).await.expect("commit");
        assert!(committed.commit_op_time > doc.block_op_time);
    }

    #[tokio::test]
    async fn splitting_policy_controls_unmarked_operations() {
        let store = MemoryDocumentStore::new();
        let (svc, _) = recover(&store, DonorConfig::default());
        let op = svc.start_operation(&["t1"], None).await.expect("start");
        drop(svc);

        let (svc, report) = recover(&store, DonorConfig::default());
        assert_eq!(report.action_for(op.id), Some(RecoveryAction::ResumedSplitting));
        assert!(svc.blockers().is_empty());
        drop(svc);

        let config = DonorConfig {
            splitting_recovery: SplittingRecoveryPolicy::Abort,
            ..DonorConfig::default()
        };
        let (svc, report) = recover(&store, config);
        assert_eq!(report.action_for(op.id), Some(RecoveryAction::AbortedSplitting));
        let status = svc.operation_status(op.id).await.expect("status");
        assert_eq!(status.state, SplitState::Aborted);
        assert_eq!(
            status.abort_reason.map(|r| r.code),
            Some(AbortCode::InterruptedByRestart)
        );
        assert_eq!(
            store.get(op.id).expect("get").expect("record").state,
            SplitState::Aborted
        );
    }

    #[tokio::test]
    async fn state_marker_disagreement_quarantines_tenants() {
        let store = MemoryDocumentStore::new();
        let (svc, _) = recover(&store, DonorConfig::default());
        let op = svc.start_operation(&["t1", "t2"], None).await.expect("start");
        let healthy = svc.start_operation(&["t3"], None).await.expect("start");
        drop(svc);

        let mut doc = store.get(op.id).expect("get").expect("record");
        doc.state = SplitState::Committed;
        store.put_raw(op.id, encode_record(&doc).expect("encode"));

        let (svc, report) = recover(&store, DonorConfig::default());
        assert_eq!(report.violations.len(), 1);
        let violation = &report.violations[0];
        assert_eq!(violation.key, op.id.to_string());
        assert_eq!(violation.error.code(), "INTEGRITYVIOLATION");
        assert_eq!(violation.quarantined.len(), 2);

        let err = svc.check_access("t1", AccessKind::Write).expect_err("quarantined");
        assert_eq!(err.code(), "INTEGRITYVIOLATION");
        let err = svc.start_operation(&["t2"], None).await.expect_err("still owned");
        assert_eq!(err.code(), "CONFLICTINGOPERATION");
        assert_eq!(report.action_for(healthy.id), Some(RecoveryAction::ResumedSplitting));
    }

    #[tokio::test]
    async fn corrupted_record_is_reported_without_quarantine() {
        let store = MemoryDocumentStore::new();
        let id = OperationId::new();
        store.put_raw(id, b"\x00\x00\x00\x00{not json".to_vec());

        let (svc, report) = recover(&store, DonorConfig::default());
        assert_eq!(report.violations.len(), 1);
        assert!(report.violations[0].quarantined.is_empty());
        assert!(svc.blockers().is_empty());
        assert!(svc.list_operations().await.is_empty());
    }

    #[tokio::test]
    async fn double_enrollment_is_an_integrity_violation_of_the_later_record() {
        let store = MemoryDocumentStore::new();
        let (svc, _) = recover(&store, DonorConfig::default());
        let first = svc.start_operation(&["t1"], None).await.expect("start");
        svc.begin_blocking(first.id).await.expect("block");
        drop(svc);

        let mut later = SplitDocument::new(
            crate::document::parse_tenant_set(&["t1", "t5"]).expect("tenants"),
            None,
            first.started_unix_ms + 1,
        );
        later.state = SplitState::Splitting;
        store.put_raw(later.id, encode_record(&later).expect("encode"));

        let (svc, report) = recover(&store, DonorConfig::default());
        assert_eq!(report.action_for(first.id), Some(RecoveryAction::BlockInstalled));
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].key, later.id.to_string());
        assert_eq!(
            report.violations[0].quarantined,
            crate::document::parse_tenant_set(&["t5"]).expect("tenants")
        );
        assert_eq!(svc.blockers().access_state(&tenant("t1")), AccessState::Block);
        let err = svc.check_access("t5", AccessKind::Write).expect_err("quarantined");
        assert_eq!(err.code(), "INTEGRITYVIOLATION");
    }

    #[test]
    fn listing_failure_aborts_startup() {
        struct Unavailable;
        impl DocumentStore for Unavailable {
            fn insert(&self, _: &SplitDocument) -> DonorResult<()> {
                Err(DonorError::persistence("down"))
            }
            fn update_if_state(&self, _: &SplitDocument, _: SplitState) -> DonorResult<()> {
                Err(DonorError::persistence("down"))
            }
            fn remove(&self, _: OperationId) -> DonorResult<()> {
                Err(DonorError::persistence("down"))
            }
            fn get(&self, _: OperationId) -> DonorResult<Option<SplitDocument>> {
                Err(DonorError::persistence("down"))
            }
            fn list(&self) -> DonorResult<Vec<crate::store::StoredRecord>> {
                Err(DonorError::persistence("down"))
            }
        }
        let err = DonorService::recover(DonorConfig::default(), Arc::new(Unavailable), FailPoints::new())
            .expect_err("startup must fail");
        assert_eq!(err.code(), "PERSISTENCEFAILURE");
    }
}
