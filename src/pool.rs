//! Pool Composition Root
//!
//! Wires admission, rate limiting, scheduling, dispatch, and health
//! monitoring into one call path:
//!
//! ```text
//! call(request)
//!   |
//!   v
//! +---------------------+
//! | AdmissionController |  <-- concurrency ceiling per (dimension, id)
//! +----------+----------+
//!            v
//! +---------------------+
//! |     RateLimiter     |  <-- pool-wide throughput budget
//! +----------+----------+
//!            v
//! +---------------------+
//! |  InstanceRegistry   |  <-- eligibility filter + selection policy
//! +----------+----------+
//!            v
//! +---------------------+
//! |     LlmClient       |  <-- timed dispatch, outcome recorded
//! +---------------------+
//! ```
//!
//! Every stage that claims a resource hands back an RAII guard, so slots are
//! returned on success, failure, and cancellation without cleanup code on
//! each path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, ConcurrencyDimension, ConcurrencyStatus};
use crate::client::{ClientFactory, GenerationRequest, GenerationResponse};
use crate::config::{InstanceConfig, PoolConfig};
use crate::error::DispatchError;
use crate::health::{HealthMonitor, HealthMonitorHandle};
use crate::rate_limit::{RateLimitStatus, RateLimiter};
use crate::scheduler::{HealthCounts, InstanceRegistry};

// ============================================================================
// Call statistics
// ============================================================================

#[derive(Default)]
struct PoolCallStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    admission_timeouts: AtomicU64,
    rate_limited: AtomicU64,
    no_instance: AtomicU64,
    total_success_time_ms: AtomicU64,
}

impl PoolCallStats {
    fn record_success(&self, elapsed_ms: u64) {
        self.total.fetch_add(1, Ordering::AcqRel);
        self.succeeded.fetch_add(1, Ordering::AcqRel);
        self.total_success_time_ms
            .fetch_add(elapsed_ms, Ordering::AcqRel);
    }

    fn record_failure(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
        self.failed.fetch_add(1, Ordering::AcqRel);
    }

    fn record_admission_timeout(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
        self.admission_timeouts.fetch_add(1, Ordering::AcqRel);
    }

    fn record_rate_limited(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
        self.rate_limited.fetch_add(1, Ordering::AcqRel);
    }

    fn record_no_instance(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
        self.no_instance.fetch_add(1, Ordering::AcqRel);
    }

    fn snapshot(&self) -> PoolStats {
        let succeeded = self.succeeded.load(Ordering::Acquire);
        let avg = if succeeded == 0 {
            0
        } else {
            self.total_success_time_ms.load(Ordering::Acquire) / succeeded
        };
        PoolStats {
            total_requests: self.total.load(Ordering::Acquire),
            succeeded,
            failed: self.failed.load(Ordering::Acquire),
            rejected_admission: self.admission_timeouts.load(Ordering::Acquire),
            rejected_rate_limit: self.rate_limited.load(Ordering::Acquire),
            rejected_no_instance: self.no_instance.load(Ordering::Acquire),
            avg_response_time_ms: avg,
        }
    }
}

/// Aggregate request statistics for one pool.
///
/// `total_requests` counts every call, including ones rejected before
/// dispatch; the rejection counters break those out.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PoolStats {
    /// Every call observed, dispatched or rejected.
    pub total_requests: u64,
    /// Dispatched requests that succeeded.
    pub succeeded: u64,
    /// Dispatched requests that failed.
    pub failed: u64,
    /// Calls rejected at admission.
    pub rejected_admission: u64,
    /// Calls rejected by the rate limiter.
    pub rejected_rate_limit: u64,
    /// Calls with no eligible instance.
    pub rejected_no_instance: u64,
    /// Cumulative mean latency of successful requests.
    pub avg_response_time_ms: u64,
}

/// Full observability snapshot of a pool.
#[derive(Clone, Debug, Serialize)]
pub struct PoolStatus {
    /// Pool name.
    pub name: String,
    /// Registered instances.
    pub instance_count: usize,
    /// Instances by health state.
    pub health: HealthCounts,
    /// Request statistics.
    pub stats: PoolStats,
    /// Configured admission limits and their occupancy.
    pub admission: Vec<ConcurrencyStatus>,
    /// Rate limiter state.
    pub rate_limit: RateLimitStatus,
}

// ============================================================================
// Pool
// ============================================================================

/// One dispatch pool over a set of backend instances.
pub struct Pool {
    name: String,
    admission: AdmissionController,
    rate_limiter: RateLimiter,
    registry: Arc<InstanceRegistry>,
    clients: Arc<dyn ClientFactory>,
    stats: PoolCallStats,
    monitor: Mutex<Option<HealthMonitorHandle>>,
    shutting_down: AtomicBool,
    admission_timeout: Duration,
    health_interval: Duration,
    health_enabled: bool,
}

impl Pool {
    /// Build a pool from config with the given client factory.
    #[must_use]
    pub fn new(config: PoolConfig, clients: Arc<dyn ClientFactory>) -> Self {
        let registry = Arc::new(InstanceRegistry::new(&config.instances, config.scheduler));
        Self {
            name: config.name,
            admission: AdmissionController::new(
                &config.concurrency_limits,
                config.admission_enabled,
            ),
            rate_limiter: RateLimiter::from_config(&config.rate_limit),
            registry,
            clients,
            stats: PoolCallStats::default(),
            monitor: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            admission_timeout: Duration::from_millis(config.admission_timeout_ms),
            health_interval: Duration::from_millis(config.health_check.interval_ms),
            health_enabled: config.health_check.enabled,
        }
    }

    /// Start background work (the health monitor). Idempotent.
    pub fn start(&self) {
        if !self.health_enabled {
            return;
        }
        let mut slot = self.monitor.lock();
        if slot.is_some() {
            return;
        }
        let monitor = HealthMonitor::new(
            self.registry.clone(),
            self.clients.clone(),
            self.health_interval,
        );
        *slot = Some(monitor.spawn());
        info!(pool = %self.name, "pool started");
    }

    /// Dispatch one request through admission, rate limiting, and selection.
    pub async fn call(
        &self,
        request: &GenerationRequest,
        dimension: ConcurrencyDimension,
        identifier: &str,
    ) -> Result<GenerationResponse, DispatchError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DispatchError::ShuttingDown);
        }

        // Admission first; a timed-out caller has claimed nothing yet.
        let _permit = self
            .admission
            .acquire_permit(dimension, identifier, self.admission_timeout)
            .await
            .ok_or_else(|| {
                self.stats.record_admission_timeout();
                DispatchError::AdmissionTimeout {
                    dimension: dimension.to_string(),
                    identifier: identifier.to_string(),
                    waited_ms: self.admission_timeout.as_millis() as u64,
                }
            })?;

        if !self.rate_limiter.try_consume() {
            self.stats.record_rate_limited();
            return Err(DispatchError::RateLimited);
        }

        let guard = self
            .registry
            .select()
            .ok_or_else(|| {
                self.stats.record_no_instance();
                DispatchError::NoInstanceAvailable {
                    pool: self.name.clone(),
                }
            })?;
        let instance = guard.instance().clone();

        let client = self
            .clients
            .get_or_create(&instance.id)
            .await
            .map_err(|source| {
                instance.record_failure();
                self.stats.record_failure();
                DispatchError::ClientUnavailable {
                    target: instance.id.clone(),
                    source,
                }
            })?;

        debug!(pool = %self.name, instance = %instance.id, request = %request.request_id, "dispatching");
        let started = tokio::time::Instant::now();
        match client.perform_call(request).await {
            Ok(mut response) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                instance.record_success(elapsed_ms);
                self.stats.record_success(elapsed_ms);
                response.duration_ms = Some(elapsed_ms);
                Ok(response)
            }
            Err(source) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                instance.record_failure();
                self.stats.record_failure();
                warn!(
                    pool = %self.name,
                    instance = %instance.id,
                    elapsed_ms,
                    error = %source,
                    "dispatch failed"
                );
                Err(DispatchError::InstanceCall {
                    instance: instance.id.clone(),
                    elapsed_ms,
                    source,
                })
            }
        }
    }

    /// Full observability snapshot.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            name: self.name.clone(),
            instance_count: self.registry.len(),
            health: self.registry.health_counts(),
            stats: self.stats.snapshot(),
            admission: self.admission.status(),
            rate_limit: self.rate_limiter.status(),
        }
    }

    /// The registry, for embedding applications that inspect instances.
    #[must_use]
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Replace the instance set wholesale from fresh topology.
    pub fn reload_instances(&self, configs: &[InstanceConfig]) {
        info!(pool = %self.name, count = configs.len(), "reloading instance topology");
        self.registry.replace_all(configs);
    }

    /// Refuse new work and stop the health monitor, waiting for it to exit.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        info!(pool = %self.name, "pool shut down");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use tokio_test::assert_ok;
    use crate::config::{
        ConcurrencyLimitConfig, HealthCheckConfig, RateLimitAlgorithm, RateLimitConfig,
    };
    use crate::instance::PROBE_FAILURE_THRESHOLD;
    use crate::test_utils::{init_tracing, MockFactory};
    use pretty_assertions::assert_eq;

    fn base_config(ids: &[&str]) -> PoolConfig {
        PoolConfig {
            name: "test".into(),
            instances: ids
                .iter()
                .map(|id| InstanceConfig::new(*id, "llama3"))
                .collect(),
            health_check: HealthCheckConfig {
                enabled: false,
                interval_ms: 1000,
            },
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_round_robin_alternates_across_calls() {
        let factory = Arc::new(MockFactory::new());
        let pool = Pool::new(base_config(&["a", "b"]), factory);
        let request = GenerationRequest::new("llama3");

        let first = pool
            .call(&request, ConcurrencyDimension::Group, "default")
            .await
            .unwrap();
        let second = pool
            .call(&request, ConcurrencyDimension::Group, "default")
            .await
            .unwrap();
        let third = pool
            .call(&request, ConcurrencyDimension::Group, "default")
            .await
            .unwrap();

        // Mock clients echo the serving target in `model`.
        assert_ne!(first.model, second.model);
        assert_eq!(first.model, third.model);
    }

    #[tokio::test]
    async fn test_admission_timeout_surfaces() {
        let factory = Arc::new(MockFactory::new());
        let mut config = base_config(&["a"]);
        config.concurrency_limits = vec![ConcurrencyLimitConfig {
            dimension: ConcurrencyDimension::Group,
            identifier: "default".into(),
            max_concurrent: 1,
            queue_capacity: 0,
        }];
        config.admission_timeout_ms = 0;
        let pool = Arc::new(Pool::new(config, factory.clone()));

        factory
            .client("a")
            .set_latency(Some(Duration::from_millis(300)));

        let in_flight = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let request = GenerationRequest::new("llama3");
                pool.call(&request, ConcurrencyDimension::Group, "default")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let request = GenerationRequest::new("llama3");
        let err = pool
            .call(&request, ConcurrencyDimension::Group, "default")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::AdmissionTimeout { .. }));

        assert!(in_flight.await.unwrap().is_ok());
        let stats = pool.status().stats;
        assert_eq!(stats.rejected_admission, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.total_requests, 2);
    }

    #[tokio::test]
    async fn test_rate_limited_request_rejected() {
        let factory = Arc::new(MockFactory::new());
        let mut config = base_config(&["a"]);
        config.rate_limit = RateLimitConfig {
            enabled: true,
            algorithm: RateLimitAlgorithm::SlidingWindow {
                window_ms: 60_000,
                max_requests: 2,
            },
        };
        let pool = Pool::new(config, factory);
        let request = GenerationRequest::new("llama3");

        for _ in 0..2 {
            pool.call(&request, ConcurrencyDimension::Group, "default")
                .await
                .unwrap();
        }
        let err = pool
            .call(&request, ConcurrencyDimension::Group, "default")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RateLimited));

        let stats = pool.status().stats;
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.rejected_rate_limit, 1);
    }

    #[tokio::test]
    async fn test_no_instance_available_when_all_failed() {
        let factory = Arc::new(MockFactory::new());
        let pool = Pool::new(base_config(&["a"]), factory);
        for _ in 0..PROBE_FAILURE_THRESHOLD {
            pool.registry().all()[0].probe_failed();
        }

        let request = GenerationRequest::new("llama3");
        let err = pool
            .call(&request, ConcurrencyDimension::Group, "default")
            .await
            .unwrap_err();
        match err {
            DispatchError::NoInstanceAvailable { pool } => assert_eq!(pool, "test"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pool.status().stats.rejected_no_instance, 1);
    }

    #[tokio::test]
    async fn test_client_unavailable_records_failure() {
        let factory = Arc::new(MockFactory::new());
        factory.fail_target("a", ClientError::NotFound("no such backend".into()));
        let pool = Pool::new(base_config(&["a"]), factory);

        let request = GenerationRequest::new("llama3");
        let err = pool
            .call(&request, ConcurrencyDimension::Group, "default")
            .await
            .unwrap_err();
        match err {
            DispatchError::ClientUnavailable { target, .. } => assert_eq!(target, "a"),
            other => panic!("unexpected error: {other}"),
        }

        let instance = pool.registry().all()[0].clone();
        assert_eq!(instance.snapshot().failure_count, 1);
        assert_eq!(instance.current_load(), 0);
        let stats = pool.status().stats;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total_requests, 1);
    }

    #[tokio::test]
    async fn test_client_failure_carries_instance_and_elapsed() {
        let factory = Arc::new(MockFactory::new());
        factory
            .client("a")
            .set_always_fail(Some(ClientError::ServiceUnavailable("down".into())));
        let pool = Pool::new(base_config(&["a"]), factory);

        let request = GenerationRequest::new("llama3");
        let err = pool
            .call(&request, ConcurrencyDimension::Group, "default")
            .await
            .unwrap_err();
        match err {
            DispatchError::InstanceCall { instance, .. } => assert_eq!(instance, "a"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_load_released_on_both_outcomes() {
        let factory = Arc::new(MockFactory::new());
        factory
            .client("a")
            .push_failure(ClientError::ServiceUnavailable("blip".into()));
        let pool = Pool::new(base_config(&["a"]), factory);
        let request = GenerationRequest::new("llama3");

        let _ = pool
            .call(&request, ConcurrencyDimension::Group, "default")
            .await;
        let _ = pool
            .call(&request, ConcurrencyDimension::Group, "default")
            .await;

        assert_eq!(pool.registry().all()[0].current_load(), 0);
    }

    #[tokio::test]
    async fn test_status_reflects_outcomes() {
        let factory = Arc::new(MockFactory::new());
        factory
            .client("a")
            .push_failure(ClientError::ServiceUnavailable("blip".into()));
        let pool = Pool::new(base_config(&["a"]), factory);
        let request = GenerationRequest::new("llama3");

        let _ = pool
            .call(&request, ConcurrencyDimension::Group, "default")
            .await;
        pool.call(&request, ConcurrencyDimension::Group, "default")
            .await
            .unwrap();

        let status = pool.status();
        assert_eq!(status.instance_count, 1);
        assert_eq!(status.stats.total_requests, 2);
        assert_eq!(status.stats.succeeded, 1);
        assert_eq!(status.stats.failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let factory = Arc::new(MockFactory::new());
        let pool = Pool::new(base_config(&["a"]), factory);
        pool.shutdown().await;

        let request = GenerationRequest::new("llama3");
        let err = pool
            .call(&request, ConcurrencyDimension::Group, "default")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_reload_swaps_instances() {
        let factory = Arc::new(MockFactory::new());
        let pool = Pool::new(base_config(&["a"]), factory);
        pool.reload_instances(&[
            InstanceConfig::new("x", "llama3"),
            InstanceConfig::new("y", "llama3"),
        ]);

        assert_eq!(pool.status().instance_count, 2);
        let request = GenerationRequest::new("llama3");
        let response = assert_ok!(
            pool.call(&request, ConcurrencyDimension::Group, "default")
                .await
        );
        assert!(response.model == "x" || response.model == "y");
    }

    #[tokio::test]
    async fn test_started_pool_takes_failing_instance_out_of_rotation() {
        init_tracing();
        let factory = Arc::new(MockFactory::new());
        factory.client("bad").set_probe_healthy(false);
        let mut config = base_config(&["bad", "good"]);
        config.health_check = HealthCheckConfig {
            enabled: true,
            interval_ms: 20,
        };
        let pool = Pool::new(config, factory);
        pool.start();

        tokio::time::sleep(Duration::from_millis(
            20 * u64::from(PROBE_FAILURE_THRESHOLD) + 50,
        ))
        .await;

        let request = GenerationRequest::new("llama3");
        for _ in 0..4 {
            let response = pool
                .call(&request, ConcurrencyDimension::Group, "default")
                .await
                .unwrap();
            assert_eq!(response.model, "good");
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_response_carries_duration() {
        let factory = Arc::new(MockFactory::new());
        factory
            .client("a")
            .set_latency(Some(Duration::from_millis(30)));
        let pool = Pool::new(base_config(&["a"]), factory);

        let request = GenerationRequest::new("llama3");
        let response = assert_ok!(
            pool.call(&request, ConcurrencyDimension::Group, "default")
                .await
        );
        assert!(response.duration_ms.unwrap() >= 30);
    }
}
