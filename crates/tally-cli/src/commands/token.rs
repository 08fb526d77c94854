//! Project token rotation and revocation.

use std::io::Write;

use anyhow::{Context, Result};
use tally_core::{ProjectToken, Tracker};

/// The explicit token, or the configured project token.
fn resolve(tracker: &Tracker, token: Option<&str>) -> Result<ProjectToken> {
    token.map_or_else(
        || Ok(tracker.project_token().clone()),
        |token| ProjectToken::new(token).context("invalid token"),
    )
}

pub async fn rotate<W: Write>(writer: &mut W, tracker: &Tracker, token: Option<&str>) -> Result<()> {
    let token = resolve(tracker, token)?;
    let rotated = tracker
        .rotate_token(&token)
        .await
        .with_context(|| format!("failed to rotate {token}"))?;

    writeln!(writer, "Rotated {token}")?;
    writeln!(writer, "New token: {rotated}")?;
    if &token == tracker.project_token() {
        writeln!(
            writer,
            "Set tracking.project_token to the new token; queued events keep the old one."
        )?;
    }
    Ok(())
}

pub async fn revoke<W: Write>(writer: &mut W, tracker: &Tracker, token: Option<&str>) -> Result<()> {
    let token = resolve(tracker, token)?;
    tracker
        .revoke_token(&token)
        .await
        .with_context(|| format!("failed to revoke {token}"))?;
    writeln!(writer, "Revoked {token}")?;
    Ok(())
}
