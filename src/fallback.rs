//! Fallback Orchestration
//!
//! Reroutes a failed primary call to standby targets. Targets hold a global
//! ascending-priority order fixed at construction; trigger predicates decide
//! which error kinds each target volunteers for. Four traversal strategies:
//!
//! - **Sequential**: ascending priority, stop at first success
//! - **Parallel**: all eligible raced under one deadline, first success wins
//! - **Random**: weighted sample without replacement, tried sequentially
//! - **Priority**: alias for Sequential
//!
//! A successful fallback is annotated with the serving target and the
//! primary's failure so callers can tell a rerouted answer from a direct one.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{ClientErrorKind, ClientFactory, GenerationRequest, GenerationResponse};
use crate::config::{FallbackConfig, FallbackStrategy, FallbackTargetConfig};
use crate::error::DispatchError;
use crate::scheduler::WEIGHT_FLOOR;

// ============================================================================
// Targets
// ============================================================================

/// One standby target with its eligibility predicate.
#[derive(Clone, Debug)]
pub struct FallbackTarget {
    /// Target name; also the client-factory target.
    pub name: String,
    /// Global order position, lower tried first.
    pub priority: u32,
    /// Weight for the Random strategy.
    pub weight: f64,
    /// Disabled targets are skipped entirely.
    pub enabled: bool,
    /// Error kinds this target volunteers for; empty accepts any.
    pub triggers: Vec<ClientErrorKind>,
}

impl FallbackTarget {
    fn from_config(config: &FallbackTargetConfig) -> Self {
        Self {
            name: config.name.clone(),
            priority: config.priority,
            weight: config.weight,
            enabled: config.enabled,
            triggers: config.triggers.clone(),
        }
    }

    /// Whether this target volunteers for the given failure.
    #[must_use]
    pub fn accepts(&self, error: &DispatchError) -> bool {
        if !self.enabled {
            return false;
        }
        if self.triggers.is_empty() {
            return true;
        }
        match error.client_kind() {
            Some(kind) => self.triggers.contains(&kind),
            // Local rejections carry no client kind; only catch-all targets
            // volunteer for them.
            None => false,
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Annotation attached to a response served by a fallback target.
#[derive(Clone, Debug)]
pub struct FallbackOutcome {
    /// Target that served the request.
    pub succeeded_target: String,
    /// Fallback attempts made, including the successful one.
    pub attempts_made: usize,
    /// The primary failure that triggered fallback.
    pub original_error: DispatchError,
}

/// Result of an orchestrated call. `outcome` is `None` when the primary
/// succeeded directly.
#[derive(Clone, Debug)]
pub struct FallbackResult {
    /// The response, from the primary or a fallback target.
    pub response: GenerationResponse,
    /// Fallback annotation, absent for a direct primary success.
    pub outcome: Option<FallbackOutcome>,
}

#[derive(Default)]
struct TargetStats {
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Per-target counters snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct TargetStatsSnapshot {
    /// Target name.
    pub name: String,
    /// Calls this target served.
    pub successes: u64,
    /// Calls this target failed.
    pub failures: u64,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs the configured fallback strategy after a primary failure.
pub struct FallbackOrchestrator {
    targets: Vec<FallbackTarget>,
    strategy: FallbackStrategy,
    max_attempts: usize,
    parallel_timeout: Duration,
    clients: Arc<dyn ClientFactory>,
    stats: DashMap<String, TargetStats>,
}

impl FallbackOrchestrator {
    /// Build an orchestrator; targets are sorted by ascending priority once,
    /// here.
    #[must_use]
    pub fn new(config: &FallbackConfig, clients: Arc<dyn ClientFactory>) -> Self {
        let mut targets: Vec<FallbackTarget> = config
            .targets
            .iter()
            .map(FallbackTarget::from_config)
            .collect();
        targets.sort_by_key(|t| t.priority);
        Self {
            targets,
            strategy: config.strategy,
            max_attempts: config.max_attempts,
            parallel_timeout: Duration::from_millis(config.parallel_timeout_ms),
            clients,
            stats: DashMap::new(),
        }
    }

    /// Run the primary, then on failure the fallback strategy.
    pub async fn execute<F, Fut>(
        &self,
        primary: F,
        request: &GenerationRequest,
    ) -> Result<FallbackResult, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GenerationResponse, DispatchError>>,
    {
        match primary().await {
            Ok(response) => Ok(FallbackResult {
                response,
                outcome: None,
            }),
            Err(primary_error) => {
                info!(request = %request.request_id, error = %primary_error, "primary failed, entering fallback");
                self.recover(primary_error, request).await
            }
        }
    }

    async fn recover(
        &self,
        primary_error: DispatchError,
        request: &GenerationRequest,
    ) -> Result<FallbackResult, DispatchError> {
        let eligible: Vec<&FallbackTarget> = self
            .targets
            .iter()
            .filter(|t| t.accepts(&primary_error))
            .collect();

        if eligible.is_empty() {
            return Err(DispatchError::FallbackExhausted {
                attempts: 0,
                tried: Vec::new(),
                last: Box::new(primary_error),
            });
        }

        match self.strategy {
            FallbackStrategy::Sequential | FallbackStrategy::Priority => {
                self.run_sequential(&eligible, primary_error, request).await
            }
            FallbackStrategy::Parallel => {
                self.run_parallel(&eligible, primary_error, request).await
            }
            FallbackStrategy::Random => {
                let sampled = self.sample_weighted(&eligible);
                self.run_sequential(&sampled, primary_error, request).await
            }
        }
    }

    async fn run_sequential(
        &self,
        targets: &[&FallbackTarget],
        primary_error: DispatchError,
        request: &GenerationRequest,
    ) -> Result<FallbackResult, DispatchError> {
        let mut tried = Vec::new();
        let mut last = primary_error.clone();

        for target in targets {
            tried.push(target.name.clone());
            debug!(target = %target.name, attempt = tried.len(), "trying fallback target");
            match self.try_target(target, request).await {
                Ok(response) => {
                    return Ok(FallbackResult {
                        response,
                        outcome: Some(FallbackOutcome {
                            succeeded_target: target.name.clone(),
                            attempts_made: tried.len(),
                            original_error: primary_error,
                        }),
                    });
                }
                Err(err) => {
                    warn!(target = %target.name, error = %err, "fallback target failed");
                    last = err;
                }
            }
        }

        Err(DispatchError::FallbackExhausted {
            attempts: tried.len(),
            tried,
            last: Box::new(last),
        })
    }

    /// Race every eligible target; the first success wins and the losing
    /// futures are dropped. Work already in flight inside a losing client is
    /// abandoned, not reclaimed.
    async fn run_parallel(
        &self,
        targets: &[&FallbackTarget],
        primary_error: DispatchError,
        request: &GenerationRequest,
    ) -> Result<FallbackResult, DispatchError> {
        let tried: Vec<String> = targets.iter().map(|t| t.name.clone()).collect();
        let mut races: FuturesUnordered<_> = targets
            .iter()
            .map(|target| async move {
                (target.name.clone(), self.try_target(target, request).await)
            })
            .collect();

        let mut last = primary_error.clone();
        let race = async {
            while let Some((name, result)) = races.next().await {
                match result {
                    Ok(response) => return Some((name, response)),
                    Err(err) => {
                        warn!(target = %name, error = %err, "fallback target failed");
                        last = err;
                    }
                }
            }
            None
        };

        let raced = tokio::time::timeout(self.parallel_timeout, race).await;
        match raced {
            Ok(Some((name, response))) => Ok(FallbackResult {
                response,
                outcome: Some(FallbackOutcome {
                    succeeded_target: name,
                    attempts_made: tried.len(),
                    original_error: primary_error,
                }),
            }),
            Ok(None) | Err(_) => Err(DispatchError::FallbackExhausted {
                attempts: tried.len(),
                tried,
                last: Box::new(last),
            }),
        }
    }

    /// Weighted sample without replacement, at most `max_attempts` draws.
    fn sample_weighted<'a>(&self, targets: &[&'a FallbackTarget]) -> Vec<&'a FallbackTarget> {
        let mut remaining: Vec<&FallbackTarget> = targets.to_vec();
        let mut sampled = Vec::new();
        let mut rng = rand::thread_rng();

        while !remaining.is_empty() && sampled.len() < self.max_attempts {
            let total: f64 = remaining.iter().map(|t| t.weight.max(WEIGHT_FLOOR)).sum();
            let mut roll = rng.gen::<f64>() * total;
            let mut picked = remaining.len() - 1;
            for (i, target) in remaining.iter().enumerate() {
                roll -= target.weight.max(WEIGHT_FLOOR);
                if roll <= 0.0 {
                    picked = i;
                    break;
                }
            }
            sampled.push(remaining.swap_remove(picked));
        }
        sampled
    }

    async fn try_target(
        &self,
        target: &FallbackTarget,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, DispatchError> {
        let client = self
            .clients
            .get_or_create(&target.name)
            .await
            .map_err(|source| {
                self.record(&target.name, false);
                DispatchError::ClientUnavailable {
                    target: target.name.clone(),
                    source,
                }
            })?;

        let started = tokio::time::Instant::now();
        match client.perform_call(request).await {
            Ok(mut response) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.record(&target.name, true);
                response.duration_ms = Some(elapsed_ms);
                Ok(response)
            }
            Err(source) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.record(&target.name, false);
                Err(DispatchError::InstanceCall {
                    instance: target.name.clone(),
                    elapsed_ms,
                    source,
                })
            }
        }
    }

    fn record(&self, target: &str, success: bool) {
        let entry = self.stats.entry(target.to_string()).or_default();
        if success {
            entry.successes.fetch_add(1, Ordering::AcqRel);
        } else {
            entry.failures.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Per-target counter snapshots, for every target that has been tried.
    #[must_use]
    pub fn stats(&self) -> Vec<TargetStatsSnapshot> {
        self.stats
            .iter()
            .map(|entry| TargetStatsSnapshot {
                name: entry.key().clone(),
                successes: entry.value().successes.load(Ordering::Acquire),
                failures: entry.value().failures.load(Ordering::Acquire),
            })
            .collect()
    }

    /// Configured targets in traversal order.
    #[must_use]
    pub fn targets(&self) -> &[FallbackTarget] {
        &self.targets
    }
}

// ============================================================================
// Tests
// ============================================================================
