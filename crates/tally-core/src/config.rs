//! Tracker configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::types::ValidationError;

/// When queued events are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Only when the caller asks for a flush.
    #[default]
    Manual,
    /// On a fixed interval, driven by a background timer.
    Periodic,
    /// Right after every insert, in addition to any explicit flush.
    Immediate,
}

impl FlushMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Periodic => "periodic",
            Self::Immediate => "immediate",
        }
    }
}

impl fmt::Display for FlushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FlushMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "periodic" => Ok(Self::Periodic),
            "immediate" => Ok(Self::Immediate),
            _ => Err(ValidationError::InvalidFlushMode {
                value: s.to_string(),
            }),
        }
    }
}

/// Settings read by the tracker. All fields have defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Project that new events are tracked against.
    pub project_token: String,
    /// Session continuation and attribution freshness window.
    pub session_timeout_secs: f64,
    pub flush_mode: FlushMode,
    /// Interval between periodic flushes.
    pub flush_period_secs: u64,
    /// Failed attempts after which a record is dropped.
    pub max_retries: u32,
    pub backoff_base_secs: f64,
    pub backoff_cap_secs: f64,
    /// Reported with campaign clicks.
    pub platform: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            project_token: String::new(),
            session_timeout_secs: 6.0,
            flush_mode: FlushMode::Manual,
            flush_period_secs: 60,
            max_retries: 10,
            backoff_base_secs: 2.0,
            backoff_cap_secs: 300.0,
            platform: "rust".to_string(),
        }
    }
}

impl TrackerConfig {
    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(secs_to_millis(self.session_timeout_secs))
    }

    pub const fn flush_period(&self) -> Duration {
        Duration::from_secs(self.flush_period_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            secs_to_duration(self.backoff_base_secs),
            secs_to_duration(self.backoff_cap_secs),
        )
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "timeouts are far below i64::MAX milliseconds"
)]
fn secs_to_millis(secs: f64) -> i64 {
    (secs.max(0.0) * 1000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config: TrackerConfig =
            serde_json::from_str(r#"{"project_token":"abc","flush_mode":"periodic"}"#).unwrap();
        assert_eq!(config.project_token, "abc");
        assert_eq!(config.flush_mode, FlushMode::Periodic);
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.session_timeout(), chrono::Duration::seconds(6));
    }

    #[test]
    fn flush_mode_rejects_unknown_values() {
        assert!("hourly".parse::<FlushMode>().is_err());
        assert_eq!("immediate".parse::<FlushMode>(), Ok(FlushMode::Immediate));
    }

    #[test]
    fn negative_durations_clamp_to_zero() {
        let config = TrackerConfig {
            session_timeout_secs: -5.0,
            backoff_base_secs: -1.0,
            ..TrackerConfig::default()
        };
        assert_eq!(config.session_timeout(), chrono::Duration::zero());
        assert_eq!(config.retry_policy().delay_for_attempt(1), Duration::ZERO);
    }
}
