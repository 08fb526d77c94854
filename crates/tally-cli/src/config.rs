//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use tally_core::TrackerConfig;

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the event database.
    pub database_path: PathBuf,
    /// Path to the saved session state.
    pub state_path: PathBuf,
    /// Collector base URL.
    pub base_url: String,
    /// Private API token for token rotation and revocation.
    pub authorization: Option<String>,
    #[serde(default)]
    pub tracking: TrackerConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("state_path", &self.state_path)
            .field("base_url", &self.base_url)
            .field(
                "authorization",
                &self.authorization.as_ref().map(|_| "[REDACTED]"),
            )
            .field("tracking", &self.tracking)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        let state_dir = dirs_state_path().unwrap_or_else(|| data_dir.clone());
        Self {
            database_path: data_dir.join("events.db"),
            state_path: state_dir.join("session.json"),
            base_url: tally_http::DEFAULT_BASE_URL.to_string(),
            authorization: None,
            tracking: TrackerConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from default locations, then optionally a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (TALLY_*, nested keys split on `__`)
        figment = figment.merge(Env::prefixed("TALLY_").split("__"));

        figment.extract()
    }
}

/// Returns the platform-specific config directory for tally.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tally"))
}

/// Returns the platform-specific data directory for tally.
///
/// On Linux: `~/.local/share/tally`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("tally"))
}

/// Returns the platform-specific state directory for tally.
///
/// On Linux: `~/.local/state/tally`. Not every platform has one; callers
/// fall back to the data directory.
pub fn dirs_state_path() -> Option<PathBuf> {
    dirs::state_dir().map(|p| p.join("tally"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tally_core::FlushMode;

    use super::*;

    #[test]
    fn test_dirs_data_path_ends_with_tally() {
        let path = dirs_data_path().unwrap();
        assert_eq!(path.file_name().unwrap(), "tally");
    }

    #[test]
    fn test_default_config_uses_data_dir_for_db() {
        let config = Config::default();
        let data_dir = dirs_data_path().unwrap();
        assert_eq!(config.database_path, data_dir.join("events.db"));
        assert_eq!(config.state_path.file_name().unwrap(), "session.json");
        assert_eq!(config.base_url, "https://api.exponea.com");
        assert_eq!(config.tracking, TrackerConfig::default());
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
database_path = "/tmp/tally-test/events.db"
authorization = "secret"

[tracking]
project_token = "project"
flush_mode = "immediate"
session_timeout_secs = 20.0
"#
        )
        .unwrap();

        let config = Config::load_from(Some(&path)).unwrap();

        assert_eq!(
            config.database_path,
            PathBuf::from("/tmp/tally-test/events.db")
        );
        assert_eq!(config.authorization.as_deref(), Some("secret"));
        assert_eq!(config.tracking.project_token, "project");
        assert_eq!(config.tracking.flush_mode, FlushMode::Immediate);
        assert!((config.tracking.session_timeout_secs - 20.0).abs() < f64::EPSILON);
        assert_eq!(config.tracking.max_retries, 10);
    }

    #[test]
    fn test_debug_redacts_authorization() {
        let config = Config {
            authorization: Some("secret-key".to_string()),
            ..Config::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("[REDACTED]"));
    }
}
