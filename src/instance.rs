//! Instance Health and Load Tracking
//!
//! Lock-free per-instance state shared between the dispatch path and the
//! health monitor. Every hot field is atomic so a status check never takes a
//! lock on the request path.
//!
//! Health transitions follow a single-writer discipline: only the health
//! monitor writes `status`, based on probe outcomes. The dispatch path
//! records call outcomes (counters, timings) but never flips health state, so
//! a burst of request failures cannot race the prober.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::InstanceConfig;

/// Consecutive probe failures before an instance is marked Failed.
pub const PROBE_FAILURE_THRESHOLD: u32 = 3;

// ============================================================================
// Health status
// ============================================================================

/// Instance health, stored as an atomic u8 on [`Instance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Probes passing, full participation.
    Healthy = 0,
    /// Recent probe failure below the threshold; still takes work.
    Degraded = 1,
    /// Probe failures reached the threshold; out of rotation.
    Failed = 2,
    /// First successful probe after Failed; back in rotation, watched.
    Recovering = 3,
}

impl HealthStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Degraded,
            2 => Self::Failed,
            3 => Self::Recovering,
            _ => Self::Healthy,
        }
    }

    /// Whether an instance in this state may receive new work.
    ///
    /// Recovering instances stay out of rotation until a further successful
    /// probe promotes them to Healthy.
    #[must_use]
    pub fn accepts_work(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

// ============================================================================
// Instance
// ============================================================================

/// One backend instance: identity plus live health, load, and performance
/// state.
pub struct Instance {
    /// Unique id; doubles as the client-factory target name.
    pub id: String,
    /// Model served by this instance.
    pub model_name: String,
    /// Group membership.
    pub group_name: String,
    /// Echelon within the group.
    pub echelon_name: String,
    /// Concurrent-request ceiling.
    pub max_concurrency: usize,
    /// Base weight for weighted selection.
    pub base_weight: f64,

    status: AtomicU8,
    consecutive_failures: AtomicU32,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    total_success_time_ms: AtomicU64,
    current_load: AtomicUsize,
    // Millis since `started_at`, +1 so that 0 can mean "never used".
    last_used_at: AtomicU64,
    started_at: Instant,
}

impl Instance {
    /// Build an instance from its static config, starting Healthy and idle.
    #[must_use]
    pub fn from_config(config: &InstanceConfig) -> Self {
        Self {
            id: config.id.clone(),
            model_name: config.model_name.clone(),
            group_name: config.group_name.clone(),
            echelon_name: config.echelon_name.clone(),
            max_concurrency: config.max_concurrency,
            base_weight: config.weight,
            status: AtomicU8::new(HealthStatus::Healthy as u8),
            consecutive_failures: AtomicU32::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            total_success_time_ms: AtomicU64::new(0),
            current_load: AtomicUsize::new(0),
            last_used_at: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Current health state.
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// In-flight request count.
    #[must_use]
    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Acquire)
    }

    /// Whether this instance may take another request right now.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.status().accepts_work() && self.current_load() < self.max_concurrency
    }

    /// Raw last-used marker: 0 = never, otherwise millis since construction
    /// plus one. Monotonic per instance; only meaningful for relative
    /// ordering.
    #[must_use]
    pub fn last_used_raw(&self) -> u64 {
        self.last_used_at.load(Ordering::Acquire)
    }

    /// Claim a load slot. `None` when the instance is ineligible or full.
    ///
    /// The returned guard decrements the load on drop, so the slot is
    /// returned on success, failure, and cancellation alike.
    #[must_use]
    pub fn try_acquire_slot(self: &Arc<Self>) -> Option<LoadGuard> {
        if !self.status().accepts_work() {
            return None;
        }
        let mut load = self.current_load.load(Ordering::Acquire);
        loop {
            if load >= self.max_concurrency {
                return None;
            }
            match self.current_load.compare_exchange_weak(
                load,
                load + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => load = actual,
            }
        }
        self.touch();
        Some(LoadGuard {
            instance: self.clone(),
        })
    }

    fn touch(&self) {
        let millis = u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_used_at
            .store(millis.saturating_add(1), Ordering::Release);
    }

    /// Record a successful call and its duration.
    pub fn record_success(&self, elapsed_ms: u64) {
        self.success_count.fetch_add(1, Ordering::AcqRel);
        self.total_success_time_ms
            .fetch_add(elapsed_ms, Ordering::AcqRel);
    }

    /// Record a failed call. Health state is untouched; only probes move it.
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Apply a successful probe: Failed comes back as Recovering, Recovering
    /// graduates to Healthy, anything else stays. Consecutive failures reset.
    pub fn probe_succeeded(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let before = self.status();
        let after = match before {
            HealthStatus::Failed => HealthStatus::Recovering,
            HealthStatus::Recovering => HealthStatus::Healthy,
            other => other,
        };
        if before != after {
            self.status.store(after as u8, Ordering::Release);
            info!(instance = %self.id, from = ?before, to = ?after, "probe recovery");
        }
    }

    /// Apply a failed probe: at [`PROBE_FAILURE_THRESHOLD`] consecutive
    /// failures the instance goes Failed; a single failure demotes Healthy to
    /// Degraded.
    pub fn probe_failed(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let before = self.status();
        let after = if failures >= PROBE_FAILURE_THRESHOLD {
            HealthStatus::Failed
        } else if before == HealthStatus::Healthy {
            HealthStatus::Degraded
        } else {
            before
        };
        if before != after {
            self.status.store(after as u8, Ordering::Release);
            warn!(
                instance = %self.id,
                consecutive = failures,
                from = ?before,
                to = ?after,
                "probe failure"
            );
        }
    }

    /// Cumulative mean response time over successful calls, 0 with none.
    #[must_use]
    pub fn avg_response_time_ms(&self) -> u64 {
        let successes = self.success_count.load(Ordering::Acquire);
        if successes == 0 {
            return 0;
        }
        self.total_success_time_ms.load(Ordering::Acquire) / successes
    }

    /// Fraction of calls that succeeded; 1.0 before any call completes.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let successes = self.success_count.load(Ordering::Acquire);
        let failures = self.failure_count.load(Ordering::Acquire);
        let total = successes + failures;
        if total == 0 {
            return 1.0;
        }
        successes as f64 / total as f64
    }

    /// Point-in-time view for observability.
    #[must_use]
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            model_name: self.model_name.clone(),
            group_name: self.group_name.clone(),
            echelon_name: self.echelon_name.clone(),
            status: self.status(),
            current_load: self.current_load(),
            max_concurrency: self.max_concurrency,
            success_count: self.success_count.load(Ordering::Acquire),
            failure_count: self.failure_count.load(Ordering::Acquire),
            consecutive_probe_failures: self.consecutive_failures.load(Ordering::Acquire),
            avg_response_time_ms: self.avg_response_time_ms(),
            success_rate: self.success_rate(),
        }
    }
}

/// Observability snapshot of one instance.
#[derive(Clone, Debug, Serialize)]
pub struct InstanceSnapshot {
    /// Instance id.
    pub id: String,
    /// Model name.
    pub model_name: String,
    /// Group name.
    pub group_name: String,
    /// Echelon name.
    pub echelon_name: String,
    /// Health state.
    pub status: HealthStatus,
    /// In-flight requests.
    pub current_load: usize,
    /// Concurrency ceiling.
    pub max_concurrency: usize,
    /// Successful calls since creation.
    pub success_count: u64,
    /// Failed calls since creation.
    pub failure_count: u64,
    /// Consecutive probe failures.
    pub consecutive_probe_failures: u32,
    /// Cumulative mean success latency.
    pub avg_response_time_ms: u64,
    /// Success fraction.
    pub success_rate: f64,
}

// ============================================================================
// Load guard
// ============================================================================

/// RAII handle for one in-flight request on an instance.
#[must_use]
pub struct LoadGuard {
    instance: Arc<Instance>,
}

impl LoadGuard {
    /// The instance this guard holds a slot on.
    #[must_use]
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        let mut load = self.instance.current_load.load(Ordering::Acquire);
        loop {
            if load == 0 {
                return;
            }
            match self.instance.current_load.compare_exchange_weak(
                load,
                load - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => load = actual,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
