//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use sporecache_service::config::Config;
use sporecache_service::metrics;

use crate::commands;
use crate::logging;

/// Sporecache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load a JSON resource through the resource cache.
    ///
    /// Every read reports whether it was served fresh, stale or had to wait for the backend.
    Get {
        /// The resource to load.
        url: Url,

        /// How many times to read the resource.
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Pause between two reads, like `500ms` or `1m`.
        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        interval: Duration,
    },

    /// Poll a JSON record until it is complete.
    ///
    /// The record counts as complete once every required JSON pointer resolves to a value other
    /// than `null`.
    Watch {
        /// The record to poll.
        url: Url,

        /// A JSON pointer that must be present, like `/taxonomy/genus`.
        #[arg(long = "require", value_name = "POINTER", required = true)]
        require: Vec<String>,
    },

    /// Print the effective cache and poller configuration.
    Config,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The tokio runtime is created below, no other threads exist yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        let hostname = config.metrics.hostname_tag.clone().and_then(|tag| {
            hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .map(|name| (tag, name))
        });
        tags.extend(hostname);
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("sporecache")
        .enable_all()
        .build()
        .context("failed to create the tokio runtime")?;

    match cli.command {
        Command::Get {
            url,
            repeat,
            interval,
        } => runtime
            .block_on(commands::get(&config, url, repeat, interval))
            .context("failed to load resource")?,
        Command::Watch { url, require } => runtime
            .block_on(commands::watch(&config, url, require))
            .context("failed to watch record")?,
        Command::Config => commands::print_config(&config)?,
    }

    Ok(())
}
