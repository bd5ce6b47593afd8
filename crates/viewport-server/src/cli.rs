//! Command-line surface (SPEC_FULL.md §2c). Derive-style `clap`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "viewport-server", about = "Real-time map-viewport localization overlay core")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "viewport-server.toml")]
    pub config: PathBuf,

    /// Override the configured log level (e.g. "debug", "trace").
    #[arg(long)]
    pub log_level: Option<String>,

    /// Discard any existing pyramid cache and rebuild it before serving.
    #[arg(long)]
    pub rebuild_pyramid_cache: bool,

    /// Run a single synchronous `match_once` against an image file and
    /// print the result as JSON, instead of starting the server.
    #[arg(long, value_name = "IMAGE_PATH")]
    pub once: Option<PathBuf>,
}
