//! Core of the tally analytics client.
//!
//! Events are persisted to an [`EventStore`] before anything else happens to
//! them. The [`SessionManager`] decides when a new session begins, the
//! [`AttributionMerger`] folds late-arriving properties into the latest
//! pending event of a type, and the [`FlushController`] delivers queued
//! records through a [`Transport`] with retries. [`Tracker`] ties them
//! together.

pub mod attribution;
pub mod campaign;
pub mod config;
pub mod error;
pub mod event;
pub mod event_type;
pub mod flush;
pub mod memory;
pub mod retry;
pub mod rotation;
pub mod session;
pub mod store;
pub mod tracker;
pub mod transport;
pub mod types;
pub mod value;

pub use attribution::{AttributionMerger, MergeOutcome};
pub use campaign::CampaignData;
pub use config::{FlushMode, TrackerConfig};
pub use error::TrackError;
pub use event::{CustomerIds, EventRecord, EventStatus, NewEvent};
pub use event_type::{EmptyEventType, EventType};
pub use flush::{FlushController, FlushReport};
pub use memory::MemoryStore;
pub use retry::RetryPolicy;
pub use rotation::TokenRotation;
pub use session::{
    EndDecision, SessionManager, SessionPhase, SessionSnapshot, SessionState, StartDecision,
};
pub use store::{EventStore, StoreError};
pub use tracker::{Tracker, TrackerState};
pub use transport::{Transport, TransportError};
pub use types::{EventId, ProjectToken, ValidationError};
pub use value::{Properties, PropertyValue};
