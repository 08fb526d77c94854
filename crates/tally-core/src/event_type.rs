//! Event type tags as the single source of truth for event type strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tag describing what an event records.
///
/// The well-known tags have dedicated variants; anything else an application
/// tracks is carried verbatim in [`EventType::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    SessionStart,
    SessionEnd,
    Payment,
    CampaignClick,
    Custom(String),
}

impl EventType {
    /// String representation for storage and the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::Payment => "payment",
            Self::CampaignClick => "campaign_click",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EmptyEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_start" => Ok(Self::SessionStart),
            "session_end" => Ok(Self::SessionEnd),
            "payment" => Ok(Self::Payment),
            "campaign_click" => Ok(Self::CampaignClick),
            other if other.trim().is_empty() => Err(EmptyEventType),
            other => Ok(Self::Custom(other.to_string())),
        }
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error returned when an event type string is blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptyEventType;

impl fmt::Display for EmptyEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("event type cannot be empty")
    }
}

impl std::error::Error for EmptyEventType {}
