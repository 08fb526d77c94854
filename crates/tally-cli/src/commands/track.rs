//! Event recording commands: track, payment, campaign, merge, identify.

use std::io::Write;

use anyhow::{Context, Result};
use tally_core::{EventType, MergeOutcome, Tracker};

use super::util::{parse_at, parse_customer_ids, parse_datetime, parse_properties};

pub fn track<W: Write>(
    writer: &mut W,
    tracker: &Tracker,
    event_type: &str,
    properties: &[String],
    customer_ids: &[String],
    at: Option<&str>,
) -> Result<()> {
    let event_type: EventType = event_type.parse()?;
    let properties = parse_properties(properties)?;
    let customer_ids = if customer_ids.is_empty() {
        tracker.customer_ids()
    } else {
        parse_customer_ids(customer_ids)?
    };
    let timestamp = at.map(parse_datetime).transpose()?;

    let record = tracker
        .track(event_type, properties, customer_ids, timestamp)
        .context("failed to track event")?;
    writeln!(writer, "Tracked {} ({})", record.event_type, record.id)?;
    Ok(())
}

pub fn payment<W: Write>(
    writer: &mut W,
    tracker: &Tracker,
    properties: &[String],
    at: Option<&str>,
) -> Result<()> {
    let properties = parse_properties(properties)?;
    let timestamp = at.map(parse_datetime).transpose()?;
    let record = tracker
        .track_payment(properties, timestamp)
        .context("failed to track payment")?;
    writeln!(writer, "Tracked {} ({})", record.event_type, record.id)?;
    Ok(())
}

pub fn campaign<W: Write>(
    writer: &mut W,
    tracker: &Tracker,
    url: &str,
    at: Option<&str>,
) -> Result<()> {
    let timestamp = at.map(parse_datetime).transpose()?;
    let record = tracker
        .track_campaign_click(url, timestamp)
        .context("failed to track campaign click")?;
    writeln!(writer, "Tracked {} ({})", record.event_type, record.id)?;
    Ok(())
}

pub fn merge<W: Write>(
    writer: &mut W,
    tracker: &Tracker,
    event_type: &str,
    properties: &[String],
    at: Option<&str>,
) -> Result<()> {
    let event_type: EventType = event_type.parse()?;
    let properties = parse_properties(properties)?;
    let now = parse_at(at)?;

    let outcome = tracker
        .apply_deferred_properties(&event_type, &properties, now)
        .context("failed to merge properties")?;
    match outcome {
        MergeOutcome::Merged(id) => writeln!(writer, "Merged into {event_type} ({id})")?,
        MergeOutcome::NoTarget => writeln!(writer, "No pending {event_type} event; nothing merged")?,
        MergeOutcome::Stale(id) => writeln!(
            writer,
            "Latest {event_type} ({id}) is older than the session timeout; nothing merged"
        )?,
    }
    Ok(())
}

pub fn identify<W: Write>(writer: &mut W, tracker: &Tracker, customer_ids: &[String]) -> Result<()> {
    let customer_ids = parse_customer_ids(customer_ids)?;
    let keys: Vec<&str> = customer_ids.iter().map(|(key, _)| key.as_str()).collect();
    writeln!(writer, "Identified customer by {}", keys.join(", "))?;
    tracker.identify(customer_ids);
    Ok(())
}
