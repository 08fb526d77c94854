//! Tally CLI library.
//!
//! This crate provides the command-line interface for the tally tracker.

mod cli;
pub mod commands;
mod config;
pub mod state;

pub use cli::{Cli, Commands, SessionAction, TokenAction};
pub use config::Config;
