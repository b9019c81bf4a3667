//! postindex daemon library exports.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (stores, ingest, sync, status, lookup, watch)

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands, StoreCommands};
pub use commands::{
    execute, init_logging, load_settings, normalize_key, read_payloads, App, CommandOutput,
    EXIT_HALTED, EXIT_INVALID,
};
