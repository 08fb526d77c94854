//! Session lifecycle with a time-based continuation rule.
//!
//! A session start arriving within the session timeout of the previous
//! session end continues that session instead of opening a new one. The
//! decision only looks at the last observed end; with no end on record (first
//! launch, or a start without an end) a new session always begins.
//!
//! State is held per project token and owned by a [`SessionManager`]
//! instance, so independent trackers (and tests) never share it.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::ProjectToken;

/// Whether a session is currently open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    NoSession,
    Active { started_at: DateTime<Utc> },
}

/// Session state for one project token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Start of the most recent logical session, kept after it ends so a
    /// continuation can resume it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_end_at: Option<DateTime<Utc>>,
}

/// Outcome of a session start signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// A new session begins at `started_at`; a `session_start` event is due.
    New { started_at: DateTime<Utc> },
    /// The previous session resumes; no event is recorded.
    Continued { started_at: DateTime<Utc> },
}

/// Outcome of a session end signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndDecision {
    /// Length of the session being closed, if one was active.
    pub duration: Option<Duration>,
}

/// Serializable copy of all session state, for carrying it across process
/// restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub sessions: HashMap<ProjectToken, SessionState>,
}

/// Tracks session state per project token.
#[derive(Debug)]
pub struct SessionManager {
    timeout: Duration,
    sessions: Mutex<HashMap<ProjectToken, SessionState>>,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_snapshot(timeout: Duration, snapshot: SessionSnapshot) -> Self {
        Self {
            timeout,
            sessions: Mutex::new(snapshot.sessions),
        }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Applies a session start signal at `now`.
    pub fn start(&self, token: &ProjectToken, now: DateTime<Utc>) -> StartDecision {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(token.clone()).or_default();

        let resumable = match (state.last_end_at, state.last_started_at) {
            (Some(ended), Some(started)) if now.signed_duration_since(ended) <= self.timeout => {
                Some(started)
            }
            _ => None,
        };

        if let Some(started_at) = resumable {
            state.phase = SessionPhase::Active { started_at };
            StartDecision::Continued { started_at }
        } else {
            state.phase = SessionPhase::Active { started_at: now };
            state.last_started_at = Some(now);
            StartDecision::New { started_at: now }
        }
    }

    /// Applies a session end signal at `now`. Ending without an active
    /// session is allowed and reports no duration.
    pub fn end(&self, token: &ProjectToken, now: DateTime<Utc>) -> EndDecision {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(token.clone()).or_default();

        let duration = match state.phase {
            SessionPhase::Active { started_at } => Some(now.signed_duration_since(started_at)),
            SessionPhase::NoSession => None,
        };
        state.phase = SessionPhase::NoSession;
        state.last_end_at = Some(now);
        EndDecision { duration }
    }

    /// Forgets all state for `token` (app teardown).
    pub fn clear(&self, token: &ProjectToken) {
        self.sessions.lock().remove(token);
    }

    pub fn state(&self, token: &ProjectToken) -> SessionState {
        self.sessions.lock().get(token).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            sessions: self.sessions.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn token() -> ProjectToken {
        ProjectToken::new("token").unwrap()
    }

    #[test]
    fn first_start_opens_new_session() {
        let sessions = SessionManager::new(Duration::seconds(60));
        assert_eq!(
            sessions.start(&token(), at(0)),
            StartDecision::New { started_at: at(0) }
        );
        assert_eq!(
            sessions.state(&token()).phase,
            SessionPhase::Active { started_at: at(0) }
        );
    }

    #[test]
    fn start_within_timeout_of_end_continues() {
        let sessions = SessionManager::new(Duration::seconds(60));
        sessions.start(&token(), at(0));
        let end = sessions.end(&token(), at(100));
        assert_eq!(end.duration, Some(Duration::seconds(100)));

        assert_eq!(
            sessions.start(&token(), at(130)),
            StartDecision::Continued { started_at: at(0) }
        );

        let end = sessions.end(&token(), at(200));
        assert_eq!(end.duration, Some(Duration::seconds(200)));
    }

    #[test]
    fn start_after_timeout_opens_new_session() {
        let sessions = SessionManager::new(Duration::seconds(60));
        sessions.start(&token(), at(0));
        sessions.end(&token(), at(100));

        assert_eq!(
            sessions.start(&token(), at(161)),
            StartDecision::New { started_at: at(161) }
        );
    }

    #[test]
    fn end_without_start_reports_no_duration() {
        let sessions = SessionManager::new(Duration::seconds(60));
        let end = sessions.end(&token(), at(5));
        assert_eq!(end.duration, None);
        assert_eq!(sessions.state(&token()).last_end_at, Some(at(5)));

        // No session was ever started, so there is nothing to continue.
        assert_eq!(
            sessions.start(&token(), at(6)),
            StartDecision::New { started_at: at(6) }
        );
    }

    #[test]
    fn tokens_are_independent() {
        let sessions = SessionManager::new(Duration::seconds(60));
        let other = ProjectToken::new("other").unwrap();
        sessions.start(&token(), at(0));
        sessions.end(&token(), at(10));

        assert!(matches!(
            sessions.start(&other, at(20)),
            StartDecision::New { .. }
        ));
        assert!(matches!(
            sessions.start(&token(), at(20)),
            StartDecision::Continued { .. }
        ));
    }

    #[test]
    fn snapshot_restores_continuation_window() {
        let sessions = SessionManager::new(Duration::seconds(60));
        sessions.start(&token(), at(0));
        sessions.end(&token(), at(30));

        let json = serde_json::to_string(&sessions.snapshot()).unwrap();
        let restored =
            SessionManager::from_snapshot(Duration::seconds(60), serde_json::from_str(&json).unwrap());

        assert_eq!(
            restored.start(&token(), at(40)),
            StartDecision::Continued { started_at: at(0) }
        );
    }

    #[test]
    fn clear_forgets_state() {
        let sessions = SessionManager::new(Duration::seconds(60));
        sessions.start(&token(), at(0));
        sessions.end(&token(), at(10));
        sessions.clear(&token());

        assert!(matches!(
            sessions.start(&token(), at(11)),
            StartDecision::New { .. }
        ));
    }
}
