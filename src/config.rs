//! Dispatch Configuration
//!
//! Serde-backed configuration surface for the pool and the fallback
//! orchestrator. Loading (files, env) is the embedding application's job;
//! this crate only consumes the deserialized values.

use serde::{Deserialize, Serialize};

use crate::admission::ConcurrencyDimension;
use crate::client::ClientErrorKind;

// ============================================================================
// Admission
// ============================================================================

/// One concurrency ceiling, keyed by dimension and identifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConcurrencyLimitConfig {
    /// Dimension this limit applies to.
    pub dimension: ConcurrencyDimension,
    /// Identifier within the dimension (group name, model name, ...).
    pub identifier: String,
    /// Maximum concurrent requests under this key.
    pub max_concurrent: usize,
    /// Advisory queue depth reported in status snapshots.
    #[serde(default)]
    pub queue_capacity: usize,
}

// ============================================================================
// Rate limiting
// ============================================================================

/// Rate limiter configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether the limiter is active at all.
    pub enabled: bool,
    /// Algorithm and its parameters.
    pub algorithm: RateLimitAlgorithm,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: RateLimitAlgorithm::TokenBucket {
                capacity: 100.0,
                refill_per_second: 10.0,
            },
        }
    }
}

/// The two supported rate-limiting algorithms.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Token bucket with lazy refill.
    TokenBucket {
        /// Maximum token count.
        capacity: f64,
        /// Tokens added per second.
        refill_per_second: f64,
    },
    /// Fixed-size sliding window over request timestamps.
    SlidingWindow {
        /// Window length in milliseconds.
        window_ms: u64,
        /// Maximum requests admitted per window.
        max_requests: usize,
    },
}

// ============================================================================
// Health checking
// ============================================================================

/// Background health-probe loop configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Whether the monitor runs at all.
    pub enabled: bool,
    /// Interval between probe cycles in milliseconds.
    pub interval_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000, // 30 seconds between probe cycles
        }
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// Instance selection strategy, fixed at pool construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStrategy {
    /// Rotate through eligible instances with a shared cursor.
    #[default]
    RoundRobin,
    /// Pick the instance idle the longest.
    LeastRecentlyUsed,
    /// Weighted-random pick over weight, latency, success rate, and load.
    Weighted,
}

// ============================================================================
// Instances
// ============================================================================

/// Static description of one backend instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Unique instance id; also the client-factory target name.
    pub id: String,
    /// Model this instance serves.
    pub model_name: String,
    /// Group the instance belongs to.
    pub group_name: String,
    /// Echelon (tier) within the group.
    pub echelon_name: String,
    /// Per-instance concurrent-request ceiling.
    pub max_concurrency: usize,
    /// Base weight for weighted selection.
    pub weight: f64,
}

impl InstanceConfig {
    /// Convenience constructor with weight 1.0 and the given concurrency.
    pub fn new(id: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model_name: model_name.into(),
            group_name: "default".to_string(),
            echelon_name: "default".to_string(),
            max_concurrency: 4,
            weight: 1.0,
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Complete pool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name, used in errors and logs.
    pub name: String,
    /// Backend instances to register at startup.
    pub instances: Vec<InstanceConfig>,
    /// Concurrency ceilings enforced at admission.
    #[serde(default)]
    pub concurrency_limits: Vec<ConcurrencyLimitConfig>,
    /// Whether admission control is enforced.
    #[serde(default = "default_true")]
    pub admission_enabled: bool,
    /// Default wait budget at admission in milliseconds.
    #[serde(default = "default_admission_timeout_ms")]
    pub admission_timeout_ms: u64,
    /// Pool-wide rate limiter.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Background health probing.
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Instance selection strategy.
    #[serde(default)]
    pub scheduler: SchedulerStrategy,
}

fn default_true() -> bool {
    true
}

fn default_admission_timeout_ms() -> u64 {
    30_000 // 30 second admission wait budget
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            instances: Vec::new(),
            concurrency_limits: Vec::new(),
            admission_enabled: true,
            admission_timeout_ms: default_admission_timeout_ms(),
            rate_limit: RateLimitConfig::default(),
            health_check: HealthCheckConfig::default(),
            scheduler: SchedulerStrategy::default(),
        }
    }
}

// ============================================================================
// Fallback
// ============================================================================

/// How the orchestrator walks its target list after a primary failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Try targets one at a time in ascending priority order.
    #[default]
    Sequential,
    /// Launch all eligible targets concurrently; first success wins.
    Parallel,
    /// Weighted-random sample of targets, tried sequentially.
    Random,
    /// Alias for `Sequential`.
    Priority,
}

/// One fallback target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FallbackTargetConfig {
    /// Target name; also the client-factory target name.
    pub name: String,
    /// Global ordering position, lower tried first.
    pub priority: u32,
    /// Weight for the Random strategy.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Disabled targets are skipped without counting as attempts.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Error kinds this target volunteers for; empty accepts any.
    #[serde(default)]
    pub triggers: Vec<ClientErrorKind>,
}

fn default_weight() -> f64 {
    1.0
}

/// Fallback orchestrator configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Traversal strategy.
    #[serde(default)]
    pub strategy: FallbackStrategy,
    /// Cap on fallback attempts (Random draws at most this many targets).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Shared deadline for the Parallel strategy in milliseconds.
    #[serde(default = "default_parallel_timeout_ms")]
    pub parallel_timeout_ms: u64,
    /// Targets, sorted by ascending priority at construction.
    pub targets: Vec<FallbackTargetConfig>,
}

fn default_max_attempts() -> usize {
    3
}

fn default_parallel_timeout_ms() -> u64 {
    10_000 // 10 second shared race deadline
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            strategy: FallbackStrategy::default(),
            max_attempts: default_max_attempts(),
            parallel_timeout_ms: default_parallel_timeout_ms(),
            targets: Vec::new(),
        }
    }
}
