//! Queue listing command.

use std::io::Write;

use anyhow::{Context, Result};
use tally_core::Tracker;

pub fn run<W: Write>(writer: &mut W, tracker: &Tracker, json: bool) -> Result<()> {
    let events = tracker.events().context("failed to read events")?;

    if json {
        for event in &events {
            let line = serde_json::to_string(event).context("failed to serialize event")?;
            writeln!(writer, "{line}")?;
        }
        return Ok(());
    }

    if events.is_empty() {
        writeln!(writer, "No queued events.")?;
        return Ok(());
    }

    writeln!(
        writer,
        "{:<5} {:<10} {:<8} {:<20} {:<25} ID",
        "SEQ", "STATUS", "ATTEMPTS", "TYPE", "TIMESTAMP"
    )?;
    for event in &events {
        writeln!(
            writer,
            "{:<5} {:<10} {:<8} {:<20} {:<25} {}",
            event.created_at,
            event.status.as_str(),
            event.attempts,
            event.event_type.as_str(),
            event.timestamp.to_rfc3339(),
            event.id
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use tally_core::{CustomerIds, EventType, Properties};

    use super::*;
    use crate::commands::testing::tracker;

    #[test]
    fn json_lines_carry_every_field() {
        let tracker = tracker();
        let at = DateTime::parse_from_rfc3339("2026-01-15T10:00:00Z")
            .unwrap()
            .to_utc();
        tracker
            .track(
                EventType::Custom("purchase".to_string()),
                Properties::new().insert("total", 9.5),
                CustomerIds::new().with("registered", "jane"),
                Some(at),
            )
            .unwrap();

        let mut output = Vec::new();
        run(&mut output, &tracker, true).unwrap();
        let output = String::from_utf8(output).unwrap();
        let value: serde_json::Value = serde_json::from_str(output.trim_end()).unwrap();

        assert_eq!(value["event_type"], "purchase");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["properties"]["total"], 9.5);
        assert_eq!(value["customer_ids"]["registered"], "jane");
        assert_eq!(value["project_token"], "project");
    }

    #[test]
    fn table_lists_in_insertion_order() {
        let tracker = tracker();
        for name in ["first", "second"] {
            tracker
                .track(
                    EventType::Custom(name.to_string()),
                    Properties::new(),
                    CustomerIds::anonymous(),
                    None,
                )
                .unwrap();
        }

        let mut output = Vec::new();
        run(&mut output, &tracker, false).unwrap();
        let output = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("SEQ"));
        assert!(lines[1].contains("first"));
        assert!(lines[2].contains("second"));
    }

    #[test]
    fn empty_table_says_so() {
        let mut output = Vec::new();
        run(&mut output, &tracker(), false).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "No queued events.\n");
    }
}
