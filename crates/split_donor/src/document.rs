//! Durable operation document for one shard-split attempt.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DonorError, DonorResult};
use crate::op_time::OpTime;

const MAX_TENANT_ID_LEN: usize = 128;

/// Unique, immutable identifier assigned when an operation is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OperationId {
    type Err = DonorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|err| DonorError::InvalidRequest(format!("invalid operation id {s:?}: {err}")))
    }
}

/// Tenant identifier. Restricted to `[A-Za-z0-9_-]` so it is safe as a
/// storage key component and on the admin wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> DonorResult<Self> {
        if raw.is_empty() {
            return Err(DonorError::InvalidRequest("tenant id must not be empty".into()));
        }
        if raw.len() > MAX_TENANT_ID_LEN {
            return Err(DonorError::InvalidRequest(format!(
                "tenant id exceeds {MAX_TENANT_ID_LEN} bytes"
            )));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(DonorError::InvalidRequest(format!(
                "tenant id {raw:?} contains invalid characters"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = DonorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Lifecycle state of a split operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitState {
    Uninitialized,
    Splitting,
    Blocking,
    Committed,
    Aborted,
    GarbageCollectable,
}

impl SplitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Splitting => "splitting",
            Self::Blocking => "blocking",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
            Self::GarbageCollectable => "garbage_collectable",
        }
    }
}

impl fmt::Display for SplitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an operation was aborted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortCode {
    /// Explicit abort decision or abandon request.
    Requested,
    /// Blocking lasted longer than the decision timeout.
    TimedOut,
    /// The process restarted while the operation was still splitting.
    InterruptedByRestart,
}

/// Persisted abort decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReason {
    pub code: AbortCode,
    pub message: String,
}

impl AbortReason {
    pub fn requested(message: impl Into<String>) -> Self {
        Self {
            code: AbortCode::Requested,
            message: message.into(),
        }
    }
}

/// Decision derived from the persisted markers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Committed { commit_op_time: OpTime },
    Aborted { reason: AbortReason },
    /// No decision recorded (or the waiter was cancelled).
    Undecided,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed { .. } => "committed",
            Self::Aborted { .. } => "aborted",
            Self::Undecided => "undecided",
        }
    }

    pub fn is_decided(&self) -> bool {
        !matches!(self, Self::Undecided)
    }
}

/// On-disk record of one shard-split attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitDocument {
    pub id: OperationId,
    pub tenant_ids: BTreeSet<TenantId>,
    #[serde(default)]
    pub recipient_set_name: Option<String>,
    pub state: SplitState,
    #[serde(default)]
    pub block_op_time: Option<OpTime>,
    #[serde(default)]
    pub commit_op_time: Option<OpTime>,
    #[serde(default)]
    pub abort_reason: Option<AbortReason>,
    #[serde(default)]
    pub expire_at_unix_ms: Option<u64>,
    #[serde(default)]
    pub started_unix_ms: u64,
    /// Wall-clock timestamp of the last persisted transition.
    #[serde(default)]
    pub last_progress_unix_ms: u64,
}

impl SplitDocument {
    /// Build a fresh document for `start`. The caller persists it in
    /// `Splitting`; `Uninitialized` only exists before the first write.
    pub fn new(
        tenant_ids: BTreeSet<TenantId>,
        recipient_set_name: Option<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            id: OperationId::new(),
            tenant_ids,
            recipient_set_name,
            state: SplitState::Uninitialized,
            block_op_time: None,
            commit_op_time: None,
            abort_reason: None,
            expire_at_unix_ms: None,
            started_unix_ms: now_ms,
            last_progress_unix_ms: now_ms,
        }
    }

    pub fn decision(&self) -> Decision {
        if let Some(commit_op_time) = self.commit_op_time {
            return Decision::Committed { commit_op_time };
        }
        if let Some(reason) = &self.abort_reason {
            return Decision::Aborted {
                reason: reason.clone(),
            };
        }
        Decision::Undecided
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.state == SplitState::GarbageCollectable
            && self.expire_at_unix_ms.is_some_and(|at| at <= now_ms)
    }

    /// Check the persisted-record invariants for the current state.
    pub fn validate(&self) -> DonorResult<()> {
        let violation = |detail: String| Err(DonorError::integrity(format!("operation {}", self.id), detail));

        if self.tenant_ids.is_empty() {
            return violation("tenant set is empty".into());
        }
        if let (Some(block), Some(commit)) = (self.block_op_time, self.commit_op_time) {
            if commit < block {
                return violation(format!(
                    "commit_op_time {commit} precedes block_op_time {block}"
                ));
            }
        }
        if self.commit_op_time.is_some() && self.abort_reason.is_some() {
            return violation("both commit and abort decisions are recorded".into());
        }
        if self.commit_op_time.is_some() && self.block_op_time.is_none() {
            return violation("commit recorded without block_op_time".into());
        }

        let has_block = self.block_op_time.is_some();
        let has_commit = self.commit_op_time.is_some();
        let has_abort = self.abort_reason.is_some();
        let has_expire = self.expire_at_unix_ms.is_some();

        let ok = match self.state {
            SplitState::Uninitialized => {
                return violation("uninitialized state must never be persisted".into());
            }
            SplitState::Splitting => !has_block && !has_commit && !has_abort && !has_expire,
            SplitState::Blocking => has_block && !has_commit && !has_abort && !has_expire,
            SplitState::Committed => has_block && has_commit && !has_abort && !has_expire,
            SplitState::Aborted => has_abort && !has_commit && !has_expire,
            SplitState::GarbageCollectable => has_expire && (has_commit || has_abort),
        };
        if !ok {
            return violation(format!(
                "state {} disagrees with markers (block={}, commit={}, abort={}, expire={})",
                self.state, has_block, has_commit, has_abort, has_expire
            ));
        }
        Ok(())
    }
}

/// Parse and deduplicate a tenant list supplied by a caller.
pub fn parse_tenant_set<S: AsRef<str>>(raw: &[S]) -> DonorResult<BTreeSet<TenantId>> {
    let mut out = BTreeSet::new();
    for tenant in raw {
        out.insert(TenantId::parse(tenant.as_ref())?);
    }
    if out.is_empty() {
        return Err(DonorError::InvalidRequest(
            "split operation requires at least one tenant".into(),
        ));
    }
    Ok(out)
}
