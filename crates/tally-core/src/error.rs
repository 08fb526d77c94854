use thiserror::Error;

use crate::event_type::EmptyEventType;
use crate::store::StoreError;
use crate::transport::TransportError;
use crate::types::{ProjectToken, ValidationError};

/// Errors returned by [`crate::Tracker`] operations.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A rotation or revocation is already running for the token.
    #[error("token operation already in progress for {token}")]
    RotationConflict { token: ProjectToken },

    #[error("invalid campaign url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl From<EmptyEventType> for TrackError {
    fn from(_: EmptyEventType) -> Self {
        Self::Validation(ValidationError::Empty {
            field: "event type",
        })
    }
}

impl TrackError {
    pub const fn is_rotation_conflict(&self) -> bool {
        matches!(self, Self::RotationConflict { .. })
    }
}
