//! Dispatch Error Taxonomy
//!
//! Every failure mode the dispatch path can surface. Client-side failures are
//! carried inside [`DispatchError::InstanceCall`] together with the instance
//! that produced them and the elapsed time, so callers and the fallback
//! orchestrator can react without re-deriving context.

use crate::client::{ClientError, ClientErrorKind};
use thiserror::Error;

/// Errors produced by the dispatch path.
#[derive(Clone, Debug, Error)]
pub enum DispatchError {
    /// Admission could not grant a slot within the caller's timeout.
    #[error("admission timed out for {dimension}:{identifier} after {waited_ms}ms")]
    AdmissionTimeout {
        /// Dimension of the limit that rejected the caller.
        dimension: String,
        /// Identifier within that dimension.
        identifier: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The pool's own rate limiter rejected the request.
    #[error("request rejected by rate limiter")]
    RateLimited,

    /// No instance is currently eligible to take the request.
    #[error("no instance available in pool '{pool}'")]
    NoInstanceAvailable {
        /// Pool that had no eligible instance.
        pool: String,
    },

    /// A dispatched call failed at the client.
    #[error("call to instance '{instance}' failed after {elapsed_ms}ms: {source}")]
    InstanceCall {
        /// Instance (or fallback target) that served the call.
        instance: String,
        /// Elapsed time before the failure.
        elapsed_ms: u64,
        /// Underlying client error.
        source: ClientError,
    },

    /// Primary and every attempted fallback target failed.
    #[error("fallback exhausted after {attempts} attempt(s) across {tried:?}: {last}")]
    FallbackExhausted {
        /// Number of fallback attempts made.
        attempts: usize,
        /// Names of the targets tried, in order.
        tried: Vec<String>,
        /// The last error observed.
        last: Box<DispatchError>,
    },

    /// A client for the target could not be created.
    #[error("no usable client for '{target}': {source}")]
    ClientUnavailable {
        /// Target the factory failed to produce a client for.
        target: String,
        /// Factory error.
        source: ClientError,
    },

    /// The pool is shutting down and takes no new work.
    #[error("pool is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    /// The client error kind behind this error, if any.
    ///
    /// Fallback trigger predicates match on this; errors that never left the
    /// dispatch core (admission, rate limiting) have no client kind.
    #[must_use]
    pub fn client_kind(&self) -> Option<ClientErrorKind> {
        match self {
            Self::InstanceCall { source, .. } | Self::ClientUnavailable { source, .. } => {
                Some(source.kind())
            }
            Self::FallbackExhausted { last, .. } => last.client_kind(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_client_kind_surfaces_through_instance_call() {
        let err = DispatchError::InstanceCall {
            instance: "node-1".into(),
            elapsed_ms: 120,
            source: ClientError::Timeout(Duration::from_millis(100)),
        };
        assert_eq!(err.client_kind(), Some(ClientErrorKind::Timeout));
    }

    #[test]
    fn test_client_kind_absent_for_local_rejections() {
        assert_eq!(DispatchError::RateLimited.client_kind(), None);
        let err = DispatchError::AdmissionTimeout {
            dimension: "group".into(),
            identifier: "default".into(),
            waited_ms: 500,
        };
        assert_eq!(err.client_kind(), None);
    }

    #[test]
    fn test_client_kind_recurses_into_exhaustion() {
        let err = DispatchError::FallbackExhausted {
            attempts: 2,
            tried: vec!["a".into(), "b".into()],
            last: Box::new(DispatchError::InstanceCall {
                instance: "b".into(),
                elapsed_ms: 30,
                source: ClientError::ServiceUnavailable("down".into()),
            }),
        };
        assert_eq!(err.client_kind(), Some(ClientErrorKind::ServiceUnavailable));
    }
}
