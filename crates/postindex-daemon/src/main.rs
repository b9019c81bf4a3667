//! postindex
//!
//! Maintains hashtag, author and date indexes over per-store post event logs.
//!
//! # Usage
//!
//! ```bash
//! postindex stores add news --config-json '{"autoSync":true}'
//! postindex ingest news posts.jsonl
//! postindex sync [--store news]
//! postindex lookup news hashtag rust
//! postindex watch
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/postindex/config.toml)
//! 3. Environment variables (POSTINDEX_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use postindex_daemon::{execute, init_logging, load_settings, App, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = load_settings(
        cli.config.as_deref(),
        cli.log_level.as_deref(),
        cli.catalog.as_deref(),
    )?;
    init_logging(&settings.log_level)?;

    let app = App::open(settings)?;
    let output = execute(&app, cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&output.body)?);

    if output.exit_code != 0 {
        std::process::exit(output.exit_code);
    }
    Ok(())
}
