//! Session lifecycle commands.

use std::io::Write;

use anyhow::{Context, Result};
use tally_core::{PropertyValue, Tracker};

use super::util::parse_at;

pub fn start<W: Write>(writer: &mut W, tracker: &Tracker, at: Option<&str>) -> Result<()> {
    let now = parse_at(at)?;
    match tracker
        .track_session_start(now)
        .context("failed to start session")?
    {
        Some(record) => writeln!(writer, "Started new session ({})", record.id)?,
        None => {
            let started = tracker
                .session_state()
                .last_started_at
                .map_or_else(|| "unknown".to_string(), |at| at.to_rfc3339());
            writeln!(writer, "Continued session started at {started}")?;
        }
    }
    Ok(())
}

pub fn end<W: Write>(writer: &mut W, tracker: &Tracker, at: Option<&str>) -> Result<()> {
    let now = parse_at(at)?;
    let record = tracker
        .track_session_end(now)
        .context("failed to end session")?;
    match record.properties.get("duration").and_then(PropertyValue::as_f64) {
        Some(secs) => writeln!(writer, "Ended session after {secs}s ({})", record.id)?,
        None => writeln!(writer, "Recorded session end with no active session ({})", record.id)?,
    }
    Ok(())
}

pub fn clear<W: Write>(writer: &mut W, tracker: &Tracker) -> Result<()> {
    tracker.clear_session();
    writeln!(writer, "Session cleared")?;
    Ok(())
}
