//! CLI argument parsing for the `postindex` binary.
//!
//! Global flags override the config file and environment.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Multi-store post indexing
///
/// Maintains hashtag, author and date indexes over per-store post event logs.
#[derive(Parser, Debug)]
#[command(name = "postindex")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/postindex/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Override the catalog database path
    #[arg(long, global = true)]
    pub catalog: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Manage the store catalog
    Stores {
        #[command(subcommand)]
        command: StoreCommands,
    },

    /// Append post payloads (JSON lines) to a store's event log
    Ingest {
        /// Store name
        store: String,

        /// File with one post payload per line
        file: PathBuf,
    },

    /// Reconcile stores against their event logs
    Sync {
        /// Only sync these stores (repeatable; default: all)
        #[arg(long = "store")]
        stores: Vec<String>,
    },

    /// Show checkpoints and index sizes
    Status {
        /// Store name (default: all stores)
        store: Option<String>,
    },

    /// List index entries under a key
    Lookup {
        /// Store name
        store: String,

        /// Index (hashtag, author, date)
        index: String,

        /// Hashtag, author handle or YYYY-MM-DD date
        key: String,
    },

    /// Run scheduled auto-sync until interrupted
    Watch,
}

#[derive(Subcommand, Debug, Clone)]
pub enum StoreCommands {
    /// Register a new store
    Add {
        /// Store name ([a-z0-9_-], starting alphanumeric)
        name: String,

        /// Store root directory (default: <data_dir>/<name>)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Free-form description
        #[arg(long)]
        description: Option<String>,

        /// Store configuration as JSON
        #[arg(long = "config-json")]
        config_json: Option<String>,
    },

    /// List registered stores
    List,

    /// Show one store
    Show {
        name: String,
    },

    /// Remove a store and its index state (event log files are kept)
    Remove {
        name: String,
    },
}
