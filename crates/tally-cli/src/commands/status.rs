//! Status command for showing the queue and session state.

use std::io::Write;

use anyhow::{Context, Result};
use tally_core::{EventStatus, SessionPhase, Tracker};

use crate::Config;

pub fn run<W: Write>(writer: &mut W, config: &Config, tracker: &Tracker) -> Result<()> {
    let events = tracker.events().context("failed to read events")?;
    let session = tracker.session_state();

    writeln!(writer, "Tally status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;
    writeln!(writer, "Project: {}", tracker.project_token())?;
    writeln!(writer, "Flush mode: {}", tracker.config().flush_mode)?;

    match (session.phase, session.last_end_at) {
        (SessionPhase::Active { started_at }, _) => {
            writeln!(writer, "Session: active since {}", started_at.to_rfc3339())?;
        }
        (SessionPhase::NoSession, Some(ended)) => {
            writeln!(writer, "Session: none (last ended {})", ended.to_rfc3339())?;
        }
        (SessionPhase::NoSession, None) => writeln!(writer, "Session: none")?,
    }

    if events.is_empty() {
        writeln!(writer, "No queued events.")?;
        return Ok(());
    }

    writeln!(writer, "Queued events: {}", events.len())?;
    for status in [
        EventStatus::Pending,
        EventStatus::InFlight,
        EventStatus::Failed,
        EventStatus::Sent,
    ] {
        let count = events.iter().filter(|e| e.status == status).count();
        if count > 0 {
            writeln!(writer, "- {status}: {count}")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::DateTime;
    use insta::assert_snapshot;
    use tally_core::{Properties, TrackerConfig};
    use tally_db::Database;

    use super::*;
    use crate::commands::testing::OfflineTransport;

    #[tokio::test]
    async fn status_command_outputs_queue_and_session() {
        let temp = tempfile::tempdir().unwrap();
        let db_path = temp.path().join("events.db");
        let db = Database::open(&db_path).unwrap();
        let tracker = Tracker::new(
            TrackerConfig {
                project_token: "project".to_string(),
                ..TrackerConfig::default()
            },
            Arc::new(db),
            Arc::new(OfflineTransport),
        )
        .unwrap();

        let start = DateTime::parse_from_rfc3339("2026-01-15T10:00:00Z")
            .unwrap()
            .to_utc();
        tracker.track_session_start(start).unwrap();
        tracker.flush().await.unwrap();
        tracker.track_payment(Properties::new(), Some(start)).unwrap();

        let config = Config {
            database_path: db_path.clone(),
            ..Config::default()
        };
        let mut output = Vec::new();
        run(&mut output, &config, &tracker).unwrap();

        let output = String::from_utf8(output).unwrap();
        let output = output.replace(&db_path.display().to_string(), "[TEMP]/events.db");
        assert_snapshot!(output, @r"
        Tally status
        Database: [TEMP]/events.db
        Project: project
        Flush mode: manual
        Session: active since 2026-01-15T10:00:00+00:00
        Queued events: 2
        - pending: 1
        - failed: 1
        ");
    }

    #[test]
    fn status_without_events_or_session() {
        let tracker = crate::commands::testing::tracker();
        let config = Config {
            database_path: "/data/events.db".into(),
            ..Config::default()
        };
        let mut output = Vec::new();
        run(&mut output, &config, &tracker).unwrap();

        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        Tally status
        Database: /data/events.db
        Project: project
        Flush mode: manual
        Session: none
        No queued events.
        ");
    }
}
