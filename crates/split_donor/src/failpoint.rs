//! Named pause points used by test harnesses.
//!
//! A failpoint that is off costs one map lookup. When on, the task that hits it
//! parks until the failpoint is switched off again; harnesses use
//! [`FailPoints::wait_for_hit`] to know the task has reached the boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{DonorError, DonorResult};

/// Pauses the async commit driver once blockers are installed.
pub const PAUSE_AFTER_BLOCKING: &str = "pause_split_after_blocking";
/// Pauses the async commit driver once the decision is durable, before the
/// operation is marked garbage collectable.
pub const PAUSE_AFTER_DECISION: &str = "pause_split_after_decision";

#[derive(Debug, Default)]
struct FailPointState {
    enabled: bool,
    hits: u64,
}

#[derive(Debug, Default)]
pub struct FailPoints {
    points: Mutex<HashMap<String, FailPointState>>,
    changed: Notify,
}

impl FailPoints {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build a registry with the comma separated names already enabled.
    pub fn from_list(list: &str) -> Arc<Self> {
        let fps = Self::new();
        for name in parse_list(list) {
            fps.set(&name, true);
        }
        fps
    }

    pub fn set(&self, name: &str, enabled: bool) {
        {
            let mut points = self.points.lock();
            points.entry(name.to_string()).or_default().enabled = enabled;
        }
        tracing::info!(failpoint = name, enabled, "failpoint updated");
        self.changed.notify_waiters();
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.points
            .lock()
            .get(name)
            .map(|fp| fp.enabled)
            .unwrap_or(false)
    }

    pub fn hits(&self, name: &str) -> u64 {
        self.points.lock().get(name).map(|fp| fp.hits).unwrap_or(0)
    }

    /// Record a hit and park while the failpoint stays enabled.
    pub async fn hit(&self, name: &str) {
        let enabled = {
            let mut points = self.points.lock();
            match points.get_mut(name) {
                Some(fp) if fp.enabled => {
                    fp.hits += 1;
                    true
                }
                _ => false,
            }
        };
        if !enabled {
            return;
        }
        self.changed.notify_waiters();
        tracing::info!(failpoint = name, "paused at failpoint");
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_enabled(name) {
                break;
            }
            notified.await;
        }
        tracing::info!(failpoint = name, "released from failpoint");
    }

    /// Wait until `name` has been hit at least once.
    pub async fn wait_for_hit(&self, name: &str, timeout: Duration) -> DonorResult<u64> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let hits = self.hits(name);
            if hits > 0 {
                return Ok(hits);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(DonorError::OperationTimedOut {
                    what: format!("failpoint {name} to be hit"),
                    waited_ms: started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
                });
            }
        }
    }
}

pub fn parse_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
