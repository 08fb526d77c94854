//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Analytics event tracker.
///
/// Queues tracking events in a local database, applies session and campaign
/// attribution rules, and delivers them to the collector.
#[derive(Debug, Parser)]
#[command(name = "tally", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Record a custom event.
    Track {
        /// Event type (e.g., `purchase`).
        event_type: String,

        /// Event property; values are parsed as JSON, falling back to a string.
        #[arg(short, long = "property", value_name = "KEY=VALUE")]
        properties: Vec<String>,

        /// Customer identifier for this event only (defaults to the saved identity).
        #[arg(long = "customer", value_name = "KEY=VALUE")]
        customer_ids: Vec<String>,

        /// Event time: ISO 8601 or relative (e.g., '5 minutes ago').
        #[arg(long)]
        at: Option<String>,
    },

    /// Record a payment.
    Payment {
        #[arg(short, long = "property", value_name = "KEY=VALUE")]
        properties: Vec<String>,

        #[arg(long)]
        at: Option<String>,
    },

    /// Record a campaign link open and attribute its UTM parameters.
    Campaign {
        /// The opened link.
        url: String,

        #[arg(long)]
        at: Option<String>,
    },

    /// Merge properties into the latest pending event of a type.
    Merge {
        event_type: String,

        #[arg(short, long = "property", value_name = "KEY=VALUE", required = true)]
        properties: Vec<String>,

        /// Merge time used for the freshness check.
        #[arg(long)]
        at: Option<String>,
    },

    /// Set the customer identity used for later events.
    Identify {
        #[arg(value_name = "KEY=VALUE", required = true)]
        customer_ids: Vec<String>,
    },

    /// Session lifecycle signals.
    #[command(subcommand)]
    Session(SessionAction),

    /// Deliver queued events now.
    Flush,

    /// List queued events.
    Events {
        /// Output JSON lines instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show queue and session status.
    Status,

    /// Project token operations.
    #[command(subcommand)]
    Token(TokenAction),
}

/// Session subcommands.
#[derive(Debug, Subcommand)]
pub enum SessionAction {
    /// Signal a session start.
    Start {
        #[arg(long)]
        at: Option<String>,
    },
    /// Signal a session end.
    End {
        #[arg(long)]
        at: Option<String>,
    },
    /// Forget the current session.
    Clear,
}

/// Token subcommands.
#[derive(Debug, Subcommand)]
pub enum TokenAction {
    /// Rotate a project token (defaults to the configured one).
    Rotate { token: Option<String> },
    /// Revoke a project token (defaults to the configured one).
    Revoke { token: Option<String> },
}
