//! Rate Limiting
//!
//! Pool-wide throughput budget, separate from admission (which bounds
//! concurrent requests, not request frequency). The algorithm is fixed at
//! construction: token bucket with lazy refill, or a sliding window over
//! request timestamps. Both run their check-and-commit inside one short
//! critical section so concurrent callers cannot overdraw the budget.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{RateLimitAlgorithm, RateLimitConfig};

// ============================================================================
// Algorithm state
// ============================================================================

/// Token bucket with lazy refill on access.
///
/// Invariant: `0 <= tokens <= capacity`.
#[derive(Debug)]
struct TokenBucketState {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucketState {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Sliding window over admitted-request timestamps.
///
/// The deque never holds entries older than `window`, and never grows past
/// `max_requests`.
#[derive(Debug)]
struct SlidingWindowState {
    window: Duration,
    max_requests: usize,
    timestamps: VecDeque<Instant>,
}

impl SlidingWindowState {
    fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            timestamps: VecDeque::with_capacity(max_requests),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }

        if self.timestamps.len() < self.max_requests {
            self.timestamps.push_back(now);
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Limiter
// ============================================================================

enum LimiterInner {
    Disabled,
    TokenBucket(Mutex<TokenBucketState>),
    SlidingWindow(Mutex<SlidingWindowState>),
}

/// Pool-wide rate limiter.
pub struct RateLimiter {
    inner: LimiterInner,
}

impl RateLimiter {
    /// Build a limiter from config. A disabled config yields a pass-through
    /// limiter regardless of algorithm parameters.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let inner = if !config.enabled {
            LimiterInner::Disabled
        } else {
            match config.algorithm {
                RateLimitAlgorithm::TokenBucket {
                    capacity,
                    refill_per_second,
                } => LimiterInner::TokenBucket(Mutex::new(TokenBucketState::new(
                    capacity,
                    refill_per_second,
                ))),
                RateLimitAlgorithm::SlidingWindow {
                    window_ms,
                    max_requests,
                } => LimiterInner::SlidingWindow(Mutex::new(SlidingWindowState::new(
                    Duration::from_millis(window_ms),
                    max_requests,
                ))),
            }
        };
        Self { inner }
    }

    /// Consume one unit of budget if available.
    pub fn try_consume(&self) -> bool {
        let admitted = match &self.inner {
            LimiterInner::Disabled => true,
            LimiterInner::TokenBucket(state) => state.lock().try_consume(),
            LimiterInner::SlidingWindow(state) => state.lock().try_consume(),
        };
        if !admitted {
            debug!("rate limiter rejected request");
        }
        admitted
    }

    /// Point-in-time view of the remaining budget.
    #[must_use]
    pub fn status(&self) -> RateLimitStatus {
        match &self.inner {
            LimiterInner::Disabled => RateLimitStatus::Disabled,
            LimiterInner::TokenBucket(state) => {
                let state = state.lock();
                RateLimitStatus::TokenBucket {
                    tokens: state.tokens,
                    capacity: state.capacity,
                }
            }
            LimiterInner::SlidingWindow(state) => {
                let state = state.lock();
                RateLimitStatus::SlidingWindow {
                    in_window: state.timestamps.len(),
                    max_requests: state.max_requests,
                }
            }
        }
    }
}

/// Snapshot of limiter state for `Pool::status()`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum RateLimitStatus {
    /// Limiter not active.
    Disabled,
    /// Token bucket: tokens currently available.
    TokenBucket {
        /// Tokens available right now (pre-refill; advisory).
        tokens: f64,
        /// Bucket capacity.
        capacity: f64,
    },
    /// Sliding window: requests inside the current window.
    SlidingWindow {
        /// Admitted requests still inside the window.
        in_window: usize,
        /// Window ceiling.
        max_requests: usize,
    },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bucket(capacity: f64, refill: f64) -> RateLimiter {
        RateLimiter::from_config(&RateLimitConfig {
            enabled: true,
            algorithm: RateLimitAlgorithm::TokenBucket {
                capacity,
                refill_per_second: refill,
            },
        })
    }

    fn window(window_ms: u64, max_requests: usize) -> RateLimiter {
        RateLimiter::from_config(&RateLimitConfig {
            enabled: true,
            algorithm: RateLimitAlgorithm::SlidingWindow {
                window_ms,
                max_requests,
            },
        })
    }

    #[test]
    fn test_disabled_limiter_always_admits() {
        let limiter = RateLimiter::from_config(&RateLimitConfig::default());
        for _ in 0..1000 {
            assert!(limiter.try_consume());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_starts_full_then_rejects() {
        let limiter = bucket(3.0, 1.0);
        assert!(limiter.try_consume());
        assert!(limiter.try_consume());
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_refills_over_time() {
        let limiter = bucket(2.0, 2.0);
        assert!(limiter.try_consume());
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());

        // 2 tokens/sec: half a second buys exactly one token.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_never_exceeds_capacity() {
        let limiter = bucket(2.0, 10.0);
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(limiter.try_consume());
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_admits_burst_then_rejects() {
        let limiter = window(1000, 5);
        for _ in 0..5 {
            assert!(limiter.try_consume());
        }
        assert!(!limiter.try_consume());
        match limiter.status() {
            RateLimitStatus::SlidingWindow {
                in_window,
                max_requests,
            } => {
                assert_eq!(in_window, 5);
                assert_eq!(max_requests, 5);
            }
            _ => panic!("wrong status variant"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reopens_after_entries_age_out() {
        let limiter = window(1000, 2);
        assert!(limiter.try_consume());
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(limiter.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_full_burst_then_refill_one() {
        let limiter = bucket(5.0, 1.0);
        for _ in 0..5 {
            assert!(limiter.try_consume());
        }
        assert!(!limiter.try_consume());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_never_admits_more_than_max_in_any_window() {
        use rand::Rng;

        let window_ms: u64 = 1000;
        let max_requests = 3;
        let limiter = window(window_ms, max_requests);
        let mut rng = rand::thread_rng();

        // Random arrival times; every admitted timestamp is recorded so any
        // window-length interval can be checked afterwards.
        let mut clock_ms: u64 = 0;
        let mut admitted: Vec<u64> = Vec::new();
        for _ in 0..200 {
            if limiter.try_consume() {
                admitted.push(clock_ms);
            }
            let step = rng.gen_range(1..200);
            tokio::time::advance(Duration::from_millis(step)).await;
            clock_ms += step;
        }

        for (i, &start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&t| t - start < window_ms)
                .count();
            assert!(
                in_window <= max_requests,
                "{in_window} requests admitted within one window starting at {start}ms"
            );
        }
    }
}
