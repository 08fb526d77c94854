//! Token rotation and revocation.
//!
//! At most one token operation runs per project token. A rotate or revoke
//! arriving while another is in progress for the same token is rejected with
//! [`TrackError::RotationConflict`] rather than queued. Queued records are
//! never rewritten: they stay bound to the token they were tracked with and
//! are flushed as usual.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::TrackError;
use crate::transport::Transport;
use crate::types::ProjectToken;

pub struct TokenRotation {
    transport: Arc<dyn Transport>,
    in_progress: Mutex<HashSet<ProjectToken>>,
}

impl std::fmt::Debug for TokenRotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRotation")
            .field("in_progress", &self.in_progress.lock().len())
            .finish_non_exhaustive()
    }
}

/// Releases the token when the operation finishes, however it finishes.
struct InProgress<'a> {
    set: &'a Mutex<HashSet<ProjectToken>>,
    token: ProjectToken,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.token);
    }
}

impl TokenRotation {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    fn begin(&self, token: &ProjectToken) -> Result<InProgress<'_>, TrackError> {
        if !self.in_progress.lock().insert(token.clone()) {
            warn!(%token, "token operation already in progress");
            return Err(TrackError::RotationConflict {
                token: token.clone(),
            });
        }
        Ok(InProgress {
            set: &self.in_progress,
            token: token.clone(),
        })
    }

    /// Asks the collector for a replacement of `token` and returns it.
    pub async fn rotate(&self, token: &ProjectToken) -> Result<ProjectToken, TrackError> {
        let _guard = self.begin(token)?;
        let rotated = self.transport.rotate_token(token).await?;
        let rotated = ProjectToken::new(rotated)?;
        info!(%token, "rotated project token");
        Ok(rotated)
    }

    pub async fn revoke(&self, token: &ProjectToken) -> Result<(), TrackError> {
        let _guard = self.begin(token)?;
        self.transport.revoke_token(token).await?;
        info!(%token, "revoked project token");
        Ok(())
    }

    pub fn is_in_progress(&self, token: &ProjectToken) -> bool {
        self.in_progress.lock().contains(token)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::event::EventRecord;
    use crate::transport::TransportError;

    /// Holds every token call until released.
    #[derive(Default)]
    struct GatedTransport {
        gate: Notify,
        fail: bool,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn send(&self, _event: &EventRecord) -> Result<(), TransportError> {
            Ok(())
        }

        async fn rotate_token(&self, token: &ProjectToken) -> Result<String, TransportError> {
            self.gate.notified().await;
            if self.fail {
                return Err(TransportError::Retryable("timeout".to_string()));
            }
            Ok(format!("{token}-next"))
        }

        async fn revoke_token(&self, _token: &ProjectToken) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn token(value: &str) -> ProjectToken {
        ProjectToken::new(value).unwrap()
    }

    #[tokio::test]
    async fn revoke_during_rotation_is_rejected() {
        let transport = Arc::new(GatedTransport::default());
        let rotation = Arc::new(TokenRotation::new(Arc::clone(&transport) as Arc<dyn Transport>));

        let pending = {
            let rotation = Arc::clone(&rotation);
            tokio::spawn(async move { rotation.rotate(&token("old")).await })
        };
        while !rotation.is_in_progress(&token("old")) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let err = rotation.revoke(&token("old")).await.unwrap_err();
        assert!(err.is_rotation_conflict());
        let err = rotation.rotate(&token("old")).await.unwrap_err();
        assert!(err.is_rotation_conflict());

        transport.gate.notify_one();
        let rotated = pending.await.unwrap().unwrap();
        assert_eq!(rotated.as_str(), "old-next");
        assert!(!rotation.is_in_progress(&token("old")));

        rotation.revoke(&token("old")).await.unwrap();
    }

    #[tokio::test]
    async fn other_tokens_are_not_blocked() {
        let transport = Arc::new(GatedTransport::default());
        let rotation = Arc::new(TokenRotation::new(Arc::clone(&transport) as Arc<dyn Transport>));

        let pending = {
            let rotation = Arc::clone(&rotation);
            tokio::spawn(async move { rotation.rotate(&token("first")).await })
        };
        while !rotation.is_in_progress(&token("first")) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        rotation.revoke(&token("second")).await.unwrap();

        transport.gate.notify_one();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_rotation_releases_token() {
        let transport = Arc::new(GatedTransport {
            gate: Notify::new(),
            fail: true,
        });
        let rotation = TokenRotation::new(Arc::clone(&transport) as Arc<dyn Transport>);

        // A stored permit lets the call through without waiting.
        transport.gate.notify_one();
        let err = rotation.rotate(&token("old")).await.unwrap_err();

        assert!(matches!(err, TrackError::Transport(_)));
        assert!(!rotation.is_in_progress(&token("old")));
    }
}
