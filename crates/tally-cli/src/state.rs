//! Tracker state saved between invocations.
//!
//! Each `tally` run is a short-lived process, so the session continuation
//! data and the customer identity are kept in a JSON file (`session.json`)
//! and restored on the next run.

use std::path::Path;

use anyhow::{Context, Result};
use tally_core::TrackerState;

/// Loads saved state.
///
/// Returns the default (no session, fresh identity) if the file doesn't
/// exist. Returns an error if the file exists but is unreadable/unparseable.
pub fn load_state(path: &Path) -> Result<TrackerState> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TrackerState::default()),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Writes state, creating the parent directory if needed.
pub fn save_state(path: &Path, state: &TrackerState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create state directory")?;
    }
    let json = serde_json::to_string_pretty(state).context("failed to serialize state")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
