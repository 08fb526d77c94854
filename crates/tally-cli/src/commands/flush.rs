//! Manual flush command.

use std::io::Write;

use anyhow::{Context, Result};
use tally_core::Tracker;

pub async fn run<W: Write>(writer: &mut W, tracker: &Tracker) -> Result<()> {
    let report = tracker.flush().await.context("flush failed")?;
    if report.is_empty() {
        writeln!(writer, "Nothing to flush.")?;
        return Ok(());
    }
    writeln!(
        writer,
        "Sent {}, retrying {}, dropped {}, skipped {}",
        report.sent, report.retried, report.dropped, report.skipped
    )?;
    if report.errors > 0 {
        writeln!(writer, "{} events could not be updated; see logs", report.errors)?;
    }
    Ok(())
}
