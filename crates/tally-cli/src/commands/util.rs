//! Shared utilities for CLI commands.

use std::sync::LazyLock;

use anyhow::{Context, bail};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use tally_core::{CustomerIds, Properties, PropertyValue};

/// Pre-compiled regex for relative time parsing.
static RELATIVE_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+(second|minute|hour|day|week)s?\s+ago$").unwrap()
});

/// Conservative bounds for relative time parsing (~1000 years in seconds).
const MAX_RELATIVE_SECONDS: i64 = 1000 * 365 * 24 * 60 * 60;

/// Parse a datetime string as either ISO 8601 or relative time.
///
/// Supports:
/// - ISO 8601: "2026-01-15T10:30:00Z"
/// - Relative: "10 seconds ago", "2 hours ago", "1 day ago", "1 week ago"
pub fn parse_datetime(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let Some(caps) = RELATIVE_TIME_RE.captures(s) else {
        bail!(
            "Invalid datetime: {s}. Use ISO 8601 (e.g., 2026-01-15T10:30:00Z) or relative (e.g., '2 hours ago')"
        );
    };

    let n: i64 = caps[1]
        .parse()
        .context("failed to parse number in relative time")?;

    let seconds_per_unit = match &caps[2] {
        "second" => 1,
        "minute" => 60,
        "hour" => 60 * 60,
        "day" => 60 * 60 * 24,
        "week" => 60 * 60 * 24 * 7,
        unit => bail!("Unknown time unit: {unit}"),
    };

    if n > MAX_RELATIVE_SECONDS / seconds_per_unit {
        bail!("Relative time value too large: {n} {}", &caps[2]);
    }

    Ok(Utc::now() - Duration::seconds(n * seconds_per_unit))
}

/// Parse an optional `--at` value, defaulting to now.
pub fn parse_at(at: Option<&str>) -> anyhow::Result<DateTime<Utc>> {
    at.map_or_else(|| Ok(Utc::now()), parse_datetime)
}

fn split_pair(pair: &str) -> anyhow::Result<(&str, &str)> {
    let Some((key, value)) = pair.split_once('=') else {
        bail!("expected KEY=VALUE, got '{pair}'");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("empty key in '{pair}'");
    }
    Ok((key, value))
}

/// Parse `KEY=VALUE` properties.
///
/// Values that parse as JSON keep their type (`n=3`, `ok=true`,
/// `tags=["a"]`); anything else is a string.
pub fn parse_properties(pairs: &[String]) -> anyhow::Result<Properties> {
    let mut properties = Properties::new();
    for pair in pairs {
        let (key, raw) = split_pair(pair)?;
        let value = serde_json::from_str::<serde_json::Value>(raw)
            .map_or_else(|_| PropertyValue::from(raw), PropertyValue::from);
        properties.set(key, value);
    }
    Ok(properties)
}

/// Parse `KEY=VALUE` customer identifiers.
pub fn parse_customer_ids(pairs: &[String]) -> anyhow::Result<CustomerIds> {
    let mut ids = CustomerIds::new();
    for pair in pairs {
        let (key, value) = split_pair(pair)?;
        ids = ids.with(key, value);
    }
    Ok(ids)
}
