//! The event store contract.
//!
//! An [`EventStore`] is the single shared mutable resource of the tracker.
//! Implementations must serialize state-changing operations per record and
//! make [`EventStore::mark_in_flight`] an atomic check-and-set: two concurrent
//! callers must never both succeed for the same record.
//!
//! # Status transitions
//!
//! ```text
//! pending --mark_in_flight--> in_flight --mark_sent--> sent --delete--> (gone)
//!    ^                            |
//!    |                       mark_failed
//!    |                            v
//!    +----(retry_at passes)---- failed --delete--> (gone, dropped)
//! ```

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::{EventRecord, EventStatus, NewEvent};
use crate::event_type::EventType;
use crate::types::EventId;
use crate::value::Properties;

/// Event store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The durable backend failed; the operation was not applied.
    #[error("storage backend failed: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The targeted record does not exist (e.g. it was already flushed).
    #[error("event {0} not found")]
    NotFound(EventId),
    /// The record's status does not allow the requested transition.
    #[error("event {id} is {status}")]
    Conflict { id: EventId, status: EventStatus },
    /// Only sent or failed records may be deleted.
    #[error("event {id} cannot be deleted while {status}")]
    NotDeletable { id: EventId, status: EventStatus },
    /// A stored record could not be decoded.
    #[error("corrupt event {id}: {message}")]
    Corrupt { id: String, message: String },
}

impl StoreError {
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Durable, ordered collection of event records.
///
/// Every method either applies completely or returns an error; a write that
/// returns `Ok` has been made durable by the backend.
pub trait EventStore: Send + Sync {
    /// Persists a new `pending` record and returns it with its assigned ID
    /// and insertion sequence. A missing timestamp defaults to now.
    fn insert(&self, event: NewEvent) -> Result<EventRecord, StoreError>;

    /// All records ordered by insertion sequence, oldest first.
    fn query_all(&self) -> Result<Vec<EventRecord>, StoreError>;

    /// The most recently inserted record of `event_type` that is pending at
    /// `now`: a `pending` record, or a `failed` one whose retry time has
    /// passed.
    fn query_latest_pending(
        &self,
        event_type: &EventType,
        now: DateTime<Utc>,
    ) -> Result<Option<EventRecord>, StoreError>;

    /// Records a flush pass at `now` may attempt: `pending` ones plus
    /// `failed` ones whose retry time has passed, oldest first.
    fn query_deliverable(&self, now: DateTime<Utc>) -> Result<Vec<EventRecord>, StoreError>;

    /// Merges `properties` into the record, overwriting colliding keys.
    ///
    /// Fails with `NotFound` if the record is gone and `Conflict` if it is
    /// already in flight or sent.
    fn update(&self, id: &EventId, properties: &Properties) -> Result<(), StoreError>;

    /// Atomically claims a `pending` or `failed` record for delivery and
    /// returns its current contents.
    fn mark_in_flight(&self, id: &EventId) -> Result<EventRecord, StoreError>;

    /// Marks an in-flight record as delivered.
    fn mark_sent(&self, id: &EventId) -> Result<(), StoreError>;

    /// Records a failed delivery attempt and returns the new attempt count.
    fn mark_failed(
        &self,
        id: &EventId,
        reason: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Removes a `sent` or `failed` record.
    fn delete(&self, id: &EventId) -> Result<(), StoreError>;

    /// Removes every `sent` record and returns how many were removed.
    fn delete_sent(&self) -> Result<usize, StoreError>;
}
