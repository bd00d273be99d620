//! InfluxDB Database Plugin
//!
//! Launched by the host, never by hand: standard output carries the
//! handshake line, logs go to standard error.
//!
//! ## Usage
//!
//! ```bash
//! # Normally started by the host with the plugin environment set
//! influxdb-database-plugin --config /etc/dbplugin/dbplugin.toml
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use dbplugin::plugin::{serve_multiplexed, ServeOptions};
use dbplugin::{influxdb, logging, Config};

#[derive(Parser, Debug)]
#[command(name = "influxdb-database-plugin", version, about = "InfluxDB database plugin")]
struct Args {
    /// Configuration file (defaults to dbplugin.toml in the working directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(&path.to_string_lossy())
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().unwrap_or_default(),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    logging::init(&config.logging).context("failed to initialize logging")?;

    serve_multiplexed(influxdb::new, ServeOptions::from_config(&config.plugin))
        .await
        .context("plugin failed")?;
    Ok(())
}
