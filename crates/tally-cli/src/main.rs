use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tally_cli::commands::{events, flush, session, status, token, track};
use tally_cli::state::{load_state, save_state};
use tally_cli::{Cli, Commands, Config, SessionAction, TokenAction};
use tally_core::Tracker;

/// Load config, open the database and restore the tracker from saved state.
fn open_tracker(config_path: Option<&Path>) -> Result<(Tracker, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = tally_db::Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    let transport = tally_http::HttpTransport::new(&config.base_url, config.authorization.clone())
        .context("failed to set up collector client")?;
    let state = load_state(&config.state_path)?;

    let tracker = Tracker::restore(
        config.tracking.clone(),
        Arc::new(db),
        Arc::new(transport),
        state,
    )
    .context("failed to start tracker (is tracking.project_token set?)")?;
    Ok((tracker, config))
}

async fn dispatch<W: Write>(
    writer: &mut W,
    command: &Commands,
    tracker: &Tracker,
    config: &Config,
) -> Result<()> {
    match command {
        Commands::Track {
            event_type,
            properties,
            customer_ids,
            at,
        } => track::track(
            writer,
            tracker,
            event_type,
            properties,
            customer_ids,
            at.as_deref(),
        ),
        Commands::Payment { properties, at } => {
            track::payment(writer, tracker, properties, at.as_deref())
        }
        Commands::Campaign { url, at } => track::campaign(writer, tracker, url, at.as_deref()),
        Commands::Merge {
            event_type,
            properties,
            at,
        } => track::merge(writer, tracker, event_type, properties, at.as_deref()),
        Commands::Identify { customer_ids } => track::identify(writer, tracker, customer_ids),
        Commands::Session(action) => match action {
            SessionAction::Start { at } => session::start(writer, tracker, at.as_deref()),
            SessionAction::End { at } => session::end(writer, tracker, at.as_deref()),
            SessionAction::Clear => session::clear(writer, tracker),
        },
        Commands::Flush => flush::run(writer, tracker).await,
        Commands::Events { json } => events::run(writer, tracker, *json),
        Commands::Status => status::run(writer, config, tracker),
        Commands::Token(action) => match action {
            TokenAction::Rotate { token: value } => {
                token::rotate(writer, tracker, value.as_deref()).await
            }
            TokenAction::Revoke { token: value } => {
                token::revoke(writer, tracker, value.as_deref()).await
            }
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let Some(command) = &cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let (tracker, config) = open_tracker(cli.config.as_deref())?;
    let mut stdout = std::io::stdout().lock();
    let result = dispatch(&mut stdout, command, &tracker, &config).await;

    // Immediate-mode deliveries finish before the session state is saved.
    tracker.shutdown().await;
    save_state(&config.state_path, &tracker.state())?;
    result
}
