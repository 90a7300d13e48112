//! LLM Client Collaborator Boundary
//!
//! Trait definitions for the external client that actually performs model
//! calls. The dispatch core observes only success/failure and elapsed time,
//! never response content, so request and response payloads stay opaque.
//!
//! # Design Philosophy
//!
//! The `LlmClient` trait provides a common interface for:
//! - Performing a generation call against one concrete backend instance
//! - Running a cheap synthetic health probe
//!
//! Implementations handle provider-specific details (API formats, auth, etc.)
//! behind this seam. Clients are obtained through a [`ClientFactory`] so that
//! no component reaches into a hidden global cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Request / Response
// ============================================================================

/// A generation request routed through the dispatch core.
///
/// The payload is carried verbatim; the core never inspects it.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    /// Unique request identifier.
    pub request_id: String,
    /// Model the caller wants to reach (backend-specific identifier).
    pub model: String,
    /// Opaque request body, handed to the client untouched.
    pub payload: serde_json::Value,
    /// Optional per-request timeout hint for the client.
    pub timeout: Option<Duration>,
}

impl GenerationRequest {
    /// Create a new request for a model with a fresh request id.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            payload: serde_json::Value::Null,
            timeout: None,
        }
    }

    /// Attach an opaque payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Attach a per-request timeout hint.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response from a completed generation call.
#[derive(Clone, Debug)]
pub struct GenerationResponse {
    /// Request this response answers.
    pub request_id: String,
    /// Model that actually served the call.
    pub model: String,
    /// Opaque response body.
    pub payload: serde_json::Value,
    /// Call duration in milliseconds, filled in by the dispatch path.
    pub duration_ms: Option<u64>,
}

// ============================================================================
// Client Errors
// ============================================================================

/// Error taxonomy of the client collaborator.
///
/// The dispatch core passes these through with elapsed-time metadata; it
/// never interprets them beyond matching their [`ClientErrorKind`] against
/// fallback trigger predicates.
#[derive(Clone, Debug, Error)]
pub enum ClientError {
    /// The call exceeded its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The backend itself rejected the call for throughput reasons.
    #[error("backend rate limited the request")]
    RateLimited,

    /// Authentication or authorization failure.
    #[error("authentication rejected by backend")]
    Auth,

    /// Model or endpoint does not exist.
    #[error("model or endpoint not found: {0}")]
    NotFound(String),

    /// The request was malformed from the backend's point of view.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The backend's content filter blocked the response.
    #[error("content filtered by backend")]
    ContentFiltered,

    /// The backend is down or overloaded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl ClientError {
    /// The kind tag for this error, used by fallback trigger predicates.
    #[must_use]
    pub fn kind(&self) -> ClientErrorKind {
        match self {
            Self::Timeout(_) => ClientErrorKind::Timeout,
            Self::RateLimited => ClientErrorKind::RateLimited,
            Self::Auth => ClientErrorKind::Auth,
            Self::NotFound(_) => ClientErrorKind::NotFound,
            Self::InvalidRequest(_) => ClientErrorKind::InvalidRequest,
            Self::ContentFiltered => ClientErrorKind::ContentFiltered,
            Self::ServiceUnavailable(_) => ClientErrorKind::ServiceUnavailable,
        }
    }
}

/// Discriminant-only view of [`ClientError`], usable in configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientErrorKind {
    /// Call deadline exceeded.
    Timeout,
    /// Backend-side rate limiting.
    RateLimited,
    /// Authentication failure.
    Auth,
    /// Unknown model or endpoint.
    NotFound,
    /// Malformed request.
    InvalidRequest,
    /// Content filter rejection.
    ContentFiltered,
    /// Backend down or overloaded.
    ServiceUnavailable,
}

// ============================================================================
// Client Traits
// ============================================================================

/// One concrete backend client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// The target this client talks to (instance id or fallback target name).
    fn name(&self) -> &str;

    /// Perform a generation call.
    async fn perform_call(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ClientError>;

    /// Cheap synthetic health probe.
    ///
    /// Implementations without a dedicated probe endpoint may issue a minimal
    /// generation call with a short timeout instead.
    async fn health_probe(&self) -> bool;
}

/// Source of clients for pool instances and fallback targets.
///
/// `get_or_create` is idempotent and may return a cached instance.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Get or lazily create the client for a named target.
    async fn get_or_create(&self, target: &str) -> Result<Arc<dyn LlmClient>, ClientError>;
}

// ============================================================================
// Client Registry
// ============================================================================

/// Builder closure invoked when a target has no cached client yet.
pub type ClientBuilder =
    dyn Fn(&str) -> Result<Arc<dyn LlmClient>, ClientError> + Send + Sync;

/// Explicit client cache passed by reference to every component that needs
/// one. Replaces process-wide client caches; there are no hidden singletons.
pub struct ClientRegistry {
    clients: DashMap<String, Arc<dyn LlmClient>>,
    builder: Box<ClientBuilder>,
}

impl ClientRegistry {
    /// Create a registry backed by a builder for cache misses.
    pub fn new(builder: Box<ClientBuilder>) -> Self {
        Self {
            clients: DashMap::new(),
            builder,
        }
    }

    /// Pre-register a client for a target.
    pub fn insert(&self, target: impl Into<String>, client: Arc<dyn LlmClient>) {
        self.clients.insert(target.into(), client);
    }

    /// Number of cached clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the registry has no cached clients.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[async_trait]
impl ClientFactory for ClientRegistry {
    async fn get_or_create(&self, target: &str) -> Result<Arc<dyn LlmClient>, ClientError> {
        if let Some(client) = self.clients.get(target) {
            return Ok(client.clone());
        }

        let built = (self.builder)(target)?;
        let client = self
            .clients
            .entry(target.to_string())
            .or_insert(built)
            .clone();
        Ok(client)
    }
}

// ============================================================================
// Tests
// ============================================================================
