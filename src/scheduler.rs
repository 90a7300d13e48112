//! Instance Registry and Selection Policies
//!
//! The registry owns the live instance set and answers selection requests
//! through a policy fixed at construction. Policies only ever see the
//! eligible subset (accepting health state, spare capacity), so an empty
//! result means "nothing can take this request right now", not a panic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

use crate::config::{InstanceConfig, SchedulerStrategy};
use crate::instance::{HealthStatus, Instance, InstanceSnapshot, LoadGuard};

/// Lower bound applied to computed weights so an instance with a poor recent
/// record keeps a nonzero chance of selection.
pub const WEIGHT_FLOOR: f64 = 0.1;

// ============================================================================
// Policies
// ============================================================================

/// One instance-selection policy over the eligible subset.
pub trait SelectionPolicy: Send + Sync {
    /// Pick one of the eligible instances, or `None` when the slice is empty.
    ///
    /// A pick is a proposal; shared policy state must not change until the
    /// caller confirms it with [`SelectionPolicy::commit`].
    fn pick(&self, eligible: &[Arc<Instance>]) -> Option<Arc<Instance>>;

    /// Confirm that the last pick turned into a successful selection.
    fn commit(&self) {}
}

/// Shared-cursor rotation. The cursor moves only on [`SelectionPolicy::commit`],
/// so neither an empty eligible set nor a pick that lost its slot to a
/// concurrent caller skews future rotation.
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    /// Fresh policy with the cursor at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for RoundRobin {
    fn pick(&self, eligible: &[Arc<Instance>]) -> Option<Arc<Instance>> {
        if eligible.is_empty() {
            return None;
        }
        let index = self.cursor.load(Ordering::Acquire) % eligible.len();
        Some(eligible[index].clone())
    }

    fn commit(&self) {
        self.cursor.fetch_add(1, Ordering::AcqRel);
    }
}

/// Picks the instance idle the longest; never-used instances sort first.
pub struct LeastRecentlyUsed;

impl SelectionPolicy for LeastRecentlyUsed {
    fn pick(&self, eligible: &[Arc<Instance>]) -> Option<Arc<Instance>> {
        eligible
            .iter()
            .min_by_key(|inst| inst.last_used_raw())
            .cloned()
    }
}

/// Weighted-random pick over base weight, latency, success rate, and load
/// headroom.
pub struct Weighted;

impl Weighted {
    fn effective_weight(instance: &Instance) -> f64 {
        let avg_ms = instance.avg_response_time_ms();
        // Neutral latency factor until the instance has history.
        let latency_factor = if avg_ms == 0 {
            1.0
        } else {
            1000.0 / avg_ms as f64
        };
        let headroom = 1.0 - instance.current_load() as f64 / instance.max_concurrency as f64;
        let weight = instance.base_weight * latency_factor * instance.success_rate() * headroom;
        weight.max(WEIGHT_FLOOR)
    }
}

impl SelectionPolicy for Weighted {
    fn pick(&self, eligible: &[Arc<Instance>]) -> Option<Arc<Instance>> {
        if eligible.is_empty() {
            return None;
        }
        let weights: Vec<f64> = eligible
            .iter()
            .map(|inst| Self::effective_weight(inst))
            .collect();
        let total: f64 = weights.iter().sum();

        let mut roll = rand::thread_rng().gen::<f64>() * total;
        for (inst, weight) in eligible.iter().zip(&weights) {
            roll -= weight;
            if roll <= 0.0 {
                return Some(inst.clone());
            }
        }
        // Floating-point residue: fall back to the last candidate.
        eligible.last().cloned()
    }
}

/// Instantiate the policy for a configured strategy.
#[must_use]
pub fn policy_from_strategy(strategy: SchedulerStrategy) -> Box<dyn SelectionPolicy> {
    match strategy {
        SchedulerStrategy::RoundRobin => Box::new(RoundRobin::new()),
        SchedulerStrategy::LeastRecentlyUsed => Box::new(LeastRecentlyUsed),
        SchedulerStrategy::Weighted => Box::new(Weighted),
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Counts of instances per health state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct HealthCounts {
    /// Healthy instances.
    pub healthy: usize,
    /// Degraded instances.
    pub degraded: usize,
    /// Failed instances.
    pub failed: usize,
    /// Recovering instances.
    pub recovering: usize,
}

/// Owns the live instance set and runs selection.
pub struct InstanceRegistry {
    instances: RwLock<Vec<Arc<Instance>>>,
    policy: Box<dyn SelectionPolicy>,
}

impl InstanceRegistry {
    /// Build a registry from topology with the given strategy.
    #[must_use]
    pub fn new(configs: &[InstanceConfig], strategy: SchedulerStrategy) -> Self {
        let instances = configs
            .iter()
            .map(|cfg| Arc::new(Instance::from_config(cfg)))
            .collect();
        Self {
            instances: RwLock::new(instances),
            policy: policy_from_strategy(strategy),
        }
    }

    /// Select an instance and claim a load slot on it.
    ///
    /// The policy's pick and the slot acquisition can race with other
    /// callers, so a pick whose slot is gone is retried against the remaining
    /// candidates, bounded by the eligible count.
    pub fn select(&self) -> Option<LoadGuard> {
        let all = self.instances.read().clone();
        let mut eligible: Vec<Arc<Instance>> =
            all.into_iter().filter(|inst| inst.is_eligible()).collect();

        while !eligible.is_empty() {
            let picked = self.policy.pick(&eligible)?;
            if let Some(guard) = picked.try_acquire_slot() {
                self.policy.commit();
                debug!(instance = %picked.id, "instance selected");
                return Some(guard);
            }
            // Slot lost to a concurrent caller; drop the candidate and retry.
            eligible.retain(|inst| !Arc::ptr_eq(inst, &picked));
        }
        None
    }

    /// All registered instances.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Instance>> {
        self.instances.read().clone()
    }

    /// Number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Replace the instance set wholesale (topology reload). Existing
    /// in-flight guards keep their old instances alive until dropped.
    pub fn replace_all(&self, configs: &[InstanceConfig]) {
        let fresh: Vec<Arc<Instance>> = configs
            .iter()
            .map(|cfg| Arc::new(Instance::from_config(cfg)))
            .collect();
        *self.instances.write() = fresh;
    }

    /// Instance counts per health state.
    #[must_use]
    pub fn health_counts(&self) -> HealthCounts {
        let mut counts = HealthCounts::default();
        for inst in self.instances.read().iter() {
            match inst.status() {
                HealthStatus::Healthy => counts.healthy += 1,
                HealthStatus::Degraded => counts.degraded += 1,
                HealthStatus::Failed => counts.failed += 1,
                HealthStatus::Recovering => counts.recovering += 1,
            }
        }
        counts
    }

    /// Snapshot every instance.
    #[must_use]
    pub fn snapshots(&self) -> Vec<InstanceSnapshot> {
        self.instances
            .read()
            .iter()
            .map(|inst| inst.snapshot())
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
