//! Mock collaborators for tests.
//!
//! `MockClient` scripts call outcomes, latency, and probe results per
//! target; `MockFactory` hands them out through the `ClientFactory` seam so
//! pool, health, and fallback tests exercise the real dispatch paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::client::{
    ClientError, ClientFactory, GenerationRequest, GenerationResponse, LlmClient,
};

/// Install a per-test tracing subscriber. First call wins; later calls are
/// no-ops. Run with `RUST_LOG=debug` to see dispatch decisions in test
/// output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scriptable client for one target.
///
/// By default every call succeeds instantly and every probe reports healthy.
/// Tests queue failures, inject latency, or flip the probe default.
pub struct MockClient {
    name: String,
    // Errors consumed FIFO before the client reverts to success.
    scripted_failures: Mutex<VecDeque<ClientError>>,
    always_fail: Mutex<Option<ClientError>>,
    latency: Mutex<Option<Duration>>,
    probe_script: Mutex<VecDeque<bool>>,
    probe_default: AtomicBool,
    call_count: AtomicU64,
    probe_count: AtomicU64,
    calls: Mutex<Vec<String>>,
}

impl MockClient {
    /// New client answering for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripted_failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            latency: Mutex::new(None),
            probe_script: Mutex::new(VecDeque::new()),
            probe_default: AtomicBool::new(true),
            call_count: AtomicU64::new(0),
            probe_count: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue one error; consumed before the client reverts to success.
    pub fn push_failure(&self, error: ClientError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Fail every call with a clone of this error until cleared.
    pub fn set_always_fail(&self, error: Option<ClientError>) {
        *self.always_fail.lock() = error;
    }

    /// Delay every call by this much.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Queue probe outcomes; consumed before the default applies.
    pub fn push_probe_result(&self, healthy: bool) {
        self.probe_script.lock().push_back(healthy);
    }

    /// Probe result once the script queue is drained.
    pub fn set_probe_healthy(&self, healthy: bool) {
        self.probe_default.store(healthy, Ordering::Release);
    }

    /// Calls performed so far.
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Acquire)
    }

    /// Probes performed so far.
    pub fn probe_count(&self) -> u64 {
        self.probe_count.load(Ordering::Acquire)
    }

    /// Request ids seen, in order.
    pub fn call_history(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LlmClient for MockClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform_call(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ClientError> {
        self.call_count.fetch_add(1, Ordering::AcqRel);
        self.calls.lock().push(request.request_id.clone());

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.always_fail.lock().clone() {
            return Err(error);
        }
        if let Some(error) = self.scripted_failures.lock().pop_front() {
            return Err(error);
        }

        Ok(GenerationResponse {
            request_id: request.request_id.clone(),
            // Echo the serving target so tests can assert routing decisions.
            model: self.name.clone(),
            payload: serde_json::json!({"mock": true}),
            duration_ms: None,
        })
    }

    async fn health_probe(&self) -> bool {
        self.probe_count.fetch_add(1, Ordering::AcqRel);
        if let Some(scripted) = self.probe_script.lock().pop_front() {
            return scripted;
        }
        self.probe_default.load(Ordering::Acquire)
    }
}

/// Factory vending one [`MockClient`] per target, created on first access.
pub struct MockFactory {
    clients: DashMap<String, Arc<MockClient>>,
    fail_targets: DashMap<String, ClientError>,
}

impl MockFactory {
    /// Empty factory; clients materialize on first use.
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            fail_targets: DashMap::new(),
        }
    }

    /// The client for a target, creating it if needed. Lets tests script a
    /// client before any dispatch touches it.
    pub fn client(&self, target: &str) -> Arc<MockClient> {
        self.clients
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(MockClient::new(target)))
            .clone()
    }

    /// Make `get_or_create` itself fail for a target.
    pub fn fail_target(&self, target: &str, error: ClientError) {
        self.fail_targets.insert(target.to_string(), error);
    }
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    async fn get_or_create(&self, target: &str) -> Result<Arc<dyn LlmClient>, ClientError> {
        if let Some(error) = self.fail_targets.get(target) {
            return Err(error.clone());
        }
        Ok(self.client(target) as Arc<dyn LlmClient>)
    }
}
