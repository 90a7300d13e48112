//! Dispatch & Resilience Core
//!
//! Health-aware dispatch for LLM request routing: admission control, rate
//! limiting, instance scheduling, background health probing, and fallback
//! orchestration, composed behind a single [`Pool`] call path.
//!
//! # Architecture
//!
//! ```text
//! +----------------------+
//! | FallbackOrchestrator |  <-- reroutes failed primaries to standbys
//! +----------+-----------+
//!            |
//!            v
//! +----------------------+
//! |         Pool         |  <-- composition root, one call path
//! +----------+-----------+
//!            |
//!   +--------+---------+----------------+
//!   v                  v                v
//! +-----------+  +------------+  +--------------+
//! | Admission |  | RateLimiter|  |  Registry +  |
//! | Controller|  |            |  |  Scheduler   |
//! +-----------+  +------------+  +------+-------+
//!                                       |
//!                                       v
//!                              +----------------+
//!                              | HealthMonitor  |  <-- probes instances
//!                              +----------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **RAII everywhere**: admission permits and load slots are guards,
//!    returned on every exit path including cancellation
//! 2. **Lock-free hot path**: per-instance state is atomic; a status check
//!    never takes a lock on the request path
//! 3. **Single-writer health**: only the probe loop moves health state, so
//!    request failures cannot race the prober
//! 4. **Explicit collaborators**: clients come from a passed-in factory,
//!    never a process-wide singleton

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

pub mod admission;
pub mod client;
pub mod config;
pub mod error;
pub mod fallback;
pub mod health;
pub mod instance;
pub mod pool;
pub mod rate_limit;
pub mod scheduler;

#[cfg(test)]
pub mod test_utils;

pub use admission::{AdmissionController, AdmissionPermit, ConcurrencyDimension};
pub use client::{
    ClientError, ClientErrorKind, ClientFactory, ClientRegistry, GenerationRequest,
    GenerationResponse, LlmClient,
};
pub use config::{
    FallbackConfig, FallbackStrategy, FallbackTargetConfig, InstanceConfig, PoolConfig,
    SchedulerStrategy,
};
pub use error::DispatchError;
pub use fallback::{FallbackOrchestrator, FallbackOutcome, FallbackResult};
pub use health::{HealthMonitor, HealthMonitorHandle};
pub use instance::{HealthStatus, Instance, InstanceSnapshot, LoadGuard};
pub use pool::{Pool, PoolStats, PoolStatus};
pub use rate_limit::{RateLimitStatus, RateLimiter};
pub use scheduler::{InstanceRegistry, SelectionPolicy};
