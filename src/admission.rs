//! Admission Control
//!
//! Per-key concurrency ceilings enforced before a request touches the
//! scheduler. Keys are (dimension, identifier) pairs so one controller can
//! hold independent limits per group, echelon, model, and node.
//!
//! Each limit is a lock-free counter with a CAS acquire loop; the timed
//! `acquire` path suspends the task between retries instead of blocking a
//! thread. Callers hold an [`AdmissionPermit`] so the slot is returned on
//! every exit path, including cancellation.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConcurrencyLimitConfig;

/// Interval between retries while waiting for a slot.
pub const ADMISSION_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Keys
// ============================================================================

/// Axis along which a concurrency limit applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyDimension {
    /// A named group of instances.
    Group,
    /// A tier within a group.
    Echelon,
    /// A model name, across groups.
    Model,
    /// A physical or logical node.
    Node,
}

impl fmt::Display for ConcurrencyDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Group => "group",
            Self::Echelon => "echelon",
            Self::Model => "model",
            Self::Node => "node",
        };
        write!(f, "{s}")
    }
}

/// Full key for one limit: dimension plus identifier within it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// Limit dimension.
    pub dimension: ConcurrencyDimension,
    /// Identifier within the dimension.
    pub identifier: String,
}

impl LimitKey {
    /// Build a key.
    pub fn new(dimension: ConcurrencyDimension, identifier: impl Into<String>) -> Self {
        Self {
            dimension,
            identifier: identifier.into(),
        }
    }
}

// ============================================================================
// One limit
// ============================================================================

/// A single concurrency ceiling.
///
/// Invariant: `0 <= current <= max_concurrent` at all times.
#[derive(Debug)]
struct ConcurrencyLimit {
    max_concurrent: usize,
    queue_capacity: usize,
    current: AtomicUsize,
}

impl ConcurrencyLimit {
    fn new(max_concurrent: usize, queue_capacity: usize) -> Self {
        Self {
            max_concurrent,
            queue_capacity,
            current: AtomicUsize::new(0),
        }
    }

    /// CAS loop: claim a slot iff one is free.
    fn try_acquire(&self) -> bool {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if current >= self.max_concurrent {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return a slot, clamped at zero so over-release cannot underflow.
    fn release(&self) {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if current == 0 {
                warn!("admission release with no outstanding slot");
                return;
            }
            match self.current.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Point-in-time view of one configured limit.
#[derive(Clone, Debug, Serialize)]
pub struct ConcurrencyStatus {
    /// Limit dimension.
    pub dimension: ConcurrencyDimension,
    /// Identifier within the dimension.
    pub identifier: String,
    /// Slots currently held.
    pub current: usize,
    /// Slot ceiling.
    pub max_concurrent: usize,
    /// Advisory queue depth from configuration.
    pub queue_capacity: usize,
}

// ============================================================================
// Controller
// ============================================================================

/// Holds every configured limit and answers acquire/release calls.
///
/// Keys with no configured limit are unlimited. A disabled controller treats
/// every call as a no-op success.
pub struct AdmissionController {
    limits: DashMap<LimitKey, Arc<ConcurrencyLimit>>,
    enabled: bool,
}

impl AdmissionController {
    /// Build a controller from limit configs.
    #[must_use]
    pub fn new(configs: &[ConcurrencyLimitConfig], enabled: bool) -> Self {
        let limits = DashMap::new();
        for cfg in configs {
            limits.insert(
                LimitKey::new(cfg.dimension, cfg.identifier.clone()),
                Arc::new(ConcurrencyLimit::new(cfg.max_concurrent, cfg.queue_capacity)),
            );
        }
        Self { limits, enabled }
    }

    /// Whether admission is being enforced.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Try to claim a slot without suspending.
    ///
    /// Returns true when the key is unconfigured or the controller disabled.
    pub fn try_acquire(&self, dimension: ConcurrencyDimension, identifier: &str) -> bool {
        if !self.enabled {
            return true;
        }
        match self.lookup(dimension, identifier) {
            Some(limit) => limit.try_acquire(),
            None => true,
        }
    }

    /// Claim a slot, suspending up to `timeout`.
    ///
    /// Retries at [`ADMISSION_POLL_INTERVAL`] without blocking other tasks.
    /// A zero timeout degenerates to a single `try_acquire`.
    pub async fn acquire(
        &self,
        dimension: ConcurrencyDimension,
        identifier: &str,
        timeout: Duration,
    ) -> bool {
        if self.try_acquire(dimension, identifier) {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                debug!(%dimension, identifier, "admission wait budget exhausted");
                return false;
            }
            tokio::time::sleep(ADMISSION_POLL_INTERVAL.min(remaining)).await;
            if self.try_acquire(dimension, identifier) {
                return true;
            }
        }
    }

    /// Return a previously claimed slot. No-op for unconfigured keys or a
    /// disabled controller.
    pub fn release(&self, dimension: ConcurrencyDimension, identifier: &str) {
        if !self.enabled {
            return;
        }
        if let Some(limit) = self.lookup(dimension, identifier) {
            limit.release();
        }
    }

    /// Timed acquire returning an RAII permit.
    ///
    /// `None` means the wait budget ran out. An `Ok` permit for an
    /// unconfigured key (or disabled controller) holds nothing and releases
    /// nothing.
    pub async fn acquire_permit(
        &self,
        dimension: ConcurrencyDimension,
        identifier: &str,
        timeout: Duration,
    ) -> Option<AdmissionPermit> {
        if !self.enabled {
            return Some(AdmissionPermit { limit: None });
        }
        let Some(limit) = self.lookup(dimension, identifier) else {
            return Some(AdmissionPermit { limit: None });
        };

        if limit.try_acquire() {
            return Some(AdmissionPermit { limit: Some(limit) });
        }
        if timeout.is_zero() {
            return None;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            tokio::time::sleep(ADMISSION_POLL_INTERVAL.min(remaining)).await;
            if limit.try_acquire() {
                return Some(AdmissionPermit { limit: Some(limit) });
            }
        }
    }

    /// Snapshot every configured limit.
    #[must_use]
    pub fn status(&self) -> Vec<ConcurrencyStatus> {
        self.limits
            .iter()
            .map(|entry| ConcurrencyStatus {
                dimension: entry.key().dimension,
                identifier: entry.key().identifier.clone(),
                current: entry.value().current.load(Ordering::Acquire),
                max_concurrent: entry.value().max_concurrent,
                queue_capacity: entry.value().queue_capacity,
            })
            .collect()
    }

    fn lookup(
        &self,
        dimension: ConcurrencyDimension,
        identifier: &str,
    ) -> Option<Arc<ConcurrencyLimit>> {
        let key = LimitKey::new(dimension, identifier);
        self.limits.get(&key).map(|entry| entry.value().clone())
    }
}

/// RAII handle for an admitted request. Dropping it returns the slot.
#[must_use]
pub struct AdmissionPermit {
    limit: Option<Arc<ConcurrencyLimit>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(limit) = self.limit.take() {
            limit.release();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
