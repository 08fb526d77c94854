//! The delivery collaborator.
//!
//! The core never talks to the network itself; it hands records and token
//! operations to a [`Transport`] and reacts to the classified outcome.

use async_trait::async_trait;
use thiserror::Error;

use crate::event::EventRecord;
use crate::types::ProjectToken;

/// Failure reported by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transient failure (network, timeout, 5xx, rate limit); try again later.
    #[error("retryable transport failure: {0}")]
    Retryable(String),
    /// The collector rejected the request; retrying cannot succeed.
    #[error("permanent transport failure: {0}")]
    Permanent(String),
    /// Credentials are missing or were refused.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Unclassified failure; treated as retryable.
    #[error("transport failure: {0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Only failures explicitly classified as permanent stop retries.
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_) | Self::Unauthorized(_))
    }

    pub const fn is_retryable(&self) -> bool {
        !self.is_permanent()
    }
}

/// Sends events and performs token operations against the collector.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers a single event.
    async fn send(&self, event: &EventRecord) -> Result<(), TransportError>;

    /// Requests a new token for `token`, returning it.
    async fn rotate_token(&self, token: &ProjectToken) -> Result<String, TransportError>;

    /// Revokes `token`.
    async fn revoke_token(&self, token: &ProjectToken) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_explicit_permanent_failures_stop_retries() {
        assert!(TransportError::Retryable("503".into()).is_retryable());
        assert!(TransportError::Other("reset".into()).is_retryable());
        assert!(TransportError::Permanent("400".into()).is_permanent());
        assert!(TransportError::Unauthorized("401".into()).is_permanent());
    }
}
