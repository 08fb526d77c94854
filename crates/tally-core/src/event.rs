//! Event records: the unit of durable state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_type::EventType;
use crate::types::{EventId, ProjectToken, ValidationError};
use crate::value::Properties;

/// Identifiers of the customer an event belongs to (e.g. `cookie`, `registered`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerIds(BTreeMap<String, String>);

impl CustomerIds {
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Anonymous identity with a random `cookie` ID.
    pub fn anonymous() -> Self {
        Self::new().with("cookie", uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Delivery status of an event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting to be delivered; attribution may still be merged into it.
    Pending,
    /// Handed to the transport by exactly one flush pass.
    InFlight,
    /// Delivered; immutable and awaiting deletion.
    Sent,
    /// Last delivery attempt failed; eligible again once `retry_at` passes.
    Failed,
}

impl EventStatus {
    /// String representation for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            _ => Err(ValidationError::InvalidStatus {
                value: s.to_string(),
            }),
        }
    }
}

/// An event about to be inserted into a store.
///
/// The store assigns the ID, insertion sequence and initial `pending` status.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub project_token: ProjectToken,
    pub customer_ids: CustomerIds,
    pub event_type: EventType,
    pub properties: Properties,
    /// Event time; `None` means "now" at insert.
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewEvent {
    pub const fn new(
        project_token: ProjectToken,
        customer_ids: CustomerIds,
        event_type: EventType,
        properties: Properties,
    ) -> Self {
        Self {
            project_token,
            customer_ids,
            event_type,
            properties,
            timestamp: None,
        }
    }

    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub project_token: ProjectToken,
    pub customer_ids: CustomerIds,
    pub event_type: EventType,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
    /// Strictly increasing insertion sequence within one store.
    pub created_at: i64,
    pub status: EventStatus,
    /// Number of failed delivery attempts so far.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl EventRecord {
    /// Whether a flush pass at `now` may attempt delivery of this record.
    pub fn is_deliverable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EventStatus::Pending => true,
            EventStatus::Failed => self.retry_at.is_none_or(|at| at <= now),
            EventStatus::InFlight | EventStatus::Sent => false,
        }
    }
}
