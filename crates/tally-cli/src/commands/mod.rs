//! CLI subcommand implementations.

pub mod events;
pub mod flush;
pub mod session;
pub mod status;
pub mod token;
pub mod track;
pub mod util;

#[cfg(test)]
mod testing;
