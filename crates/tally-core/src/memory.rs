//! In-memory event store.
//!
//! Not durable across restarts. Used for tests and for callers that accept
//! losing queued events when the process exits.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::event::{EventRecord, EventStatus, NewEvent};
use crate::event_type::EventType;
use crate::store::{EventStore, StoreError};
use crate::types::EventId;
use crate::value::Properties;

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: i64,
    /// Kept in insertion order.
    events: Vec<EventRecord>,
}

impl MemoryState {
    fn find_mut(&mut self, id: &EventId) -> Result<&mut EventRecord, StoreError> {
        self.events
            .iter_mut()
            .find(|event| &event.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

/// An [`EventStore`] backed by a mutex-guarded vector.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryStore {
    fn insert(&self, event: NewEvent) -> Result<EventRecord, StoreError> {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let record = EventRecord {
            id: EventId::generate(),
            project_token: event.project_token,
            customer_ids: event.customer_ids,
            event_type: event.event_type,
            properties: event.properties,
            timestamp: event.timestamp.unwrap_or_else(Utc::now),
            created_at: state.next_seq,
            status: EventStatus::Pending,
            attempts: 0,
            last_error: None,
            retry_at: None,
        };
        state.events.push(record.clone());
        Ok(record)
    }

    fn query_all(&self) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.state.lock().events.clone())
    }

    fn query_latest_pending(
        &self,
        event_type: &EventType,
        now: DateTime<Utc>,
    ) -> Result<Option<EventRecord>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .events
            .iter()
            .rev()
            .find(|event| &event.event_type == event_type && event.is_deliverable(now))
            .cloned())
    }

    fn query_deliverable(&self, now: DateTime<Utc>) -> Result<Vec<EventRecord>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .events
            .iter()
            .filter(|event| event.is_deliverable(now))
            .cloned()
            .collect())
    }

    fn update(&self, id: &EventId, properties: &Properties) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let event = state.find_mut(id)?;
        match event.status {
            EventStatus::Pending | EventStatus::Failed => {
                event.properties.merge(properties);
                Ok(())
            }
            status => Err(StoreError::Conflict {
                id: id.clone(),
                status,
            }),
        }
    }

    fn mark_in_flight(&self, id: &EventId) -> Result<EventRecord, StoreError> {
        let mut state = self.state.lock();
        let event = state.find_mut(id)?;
        match event.status {
            EventStatus::Pending | EventStatus::Failed => {
                event.status = EventStatus::InFlight;
                Ok(event.clone())
            }
            status => Err(StoreError::Conflict {
                id: id.clone(),
                status,
            }),
        }
    }

    fn mark_sent(&self, id: &EventId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let event = state.find_mut(id)?;
        if event.status != EventStatus::InFlight {
            return Err(StoreError::Conflict {
                id: id.clone(),
                status: event.status,
            });
        }
        event.status = EventStatus::Sent;
        Ok(())
    }

    fn mark_failed(
        &self,
        id: &EventId,
        reason: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut state = self.state.lock();
        let event = state.find_mut(id)?;
        if event.status == EventStatus::Sent {
            return Err(StoreError::Conflict {
                id: id.clone(),
                status: event.status,
            });
        }
        event.status = EventStatus::Failed;
        event.attempts += 1;
        event.last_error = Some(reason.to_string());
        event.retry_at = Some(retry_at);
        Ok(event.attempts)
    }

    fn delete(&self, id: &EventId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let index = state
            .events
            .iter()
            .position(|event| &event.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let status = state.events[index].status;
        match status {
            EventStatus::Sent | EventStatus::Failed => {
                state.events.remove(index);
                Ok(())
            }
            EventStatus::Pending | EventStatus::InFlight => Err(StoreError::NotDeletable {
                id: id.clone(),
                status,
            }),
        }
    }

    fn delete_sent(&self) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let before = state.events.len();
        state.events.retain(|event| event.status != EventStatus::Sent);
        Ok(before - state.events.len())
    }
}
