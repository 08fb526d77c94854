//! Test helpers shared by command tests.

use std::sync::Arc;

use async_trait::async_trait;
use tally_core::{
    EventRecord, MemoryStore, ProjectToken, Tracker, TrackerConfig, Transport, TransportError,
};

/// A collector that is never reachable.
pub struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    async fn send(&self, _event: &EventRecord) -> Result<(), TransportError> {
        Err(TransportError::Retryable("connection refused".to_string()))
    }

    async fn rotate_token(&self, _token: &ProjectToken) -> Result<String, TransportError> {
        Err(TransportError::Retryable("connection refused".to_string()))
    }

    async fn revoke_token(&self, _token: &ProjectToken) -> Result<(), TransportError> {
        Err(TransportError::Retryable("connection refused".to_string()))
    }
}

/// A manual-mode tracker over an in-memory store.
pub fn tracker() -> Tracker {
    Tracker::new(
        TrackerConfig {
            project_token: "project".to_string(),
            ..TrackerConfig::default()
        },
        Arc::new(MemoryStore::new()),
        Arc::new(OfflineTransport),
    )
    .unwrap()
}
