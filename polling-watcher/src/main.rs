use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use codex_polling_watcher::{PollingWatcher, WatcherConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Poll a directory tree and print change records as JSON lines.
#[derive(Debug, Parser)]
#[command(name = "codex-poll-watch", version)]
struct Cli {
    /// Directory to watch. Overrides `root_path` from the config file.
    root: Option<PathBuf>,

    /// TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Polling interval in milliseconds.
    #[arg(short, long)]
    interval_ms: Option<u64>,

    /// File name glob to exclude. May be repeated.
    #[arg(short, long = "exclude")]
    excludes: Vec<String>,

    /// Only watch the root's immediate children.
    #[arg(long)]
    no_recursive: bool,

    /// Do not report entries that exist at startup.
    #[arg(long)]
    baseline: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<WatcherConfig> {
        let mut config = match &self.config {
            Some(path) => WatcherConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => WatcherConfig::default(),
        };

        if let Some(root) = self.root {
            config.root_path = root;
        }
        if let Some(ms) = self.interval_ms {
            config.polling_interval = Duration::from_millis(ms);
        }
        config.exclude_patterns.extend(self.excludes);
        if self.no_recursive {
            config.include_subdirectories = false;
        }
        if self.baseline {
            config.baseline = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Cli::parse().into_config()?;
    let watcher = PollingWatcher::new(config)?;

    watcher.on_change(|record| {
        println!("{}", serde_json::to_string(record)?);
        Ok(())
    });
    watcher.on_error(|e| error!("{e}"));
    watcher.start()?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = watcher.stopped() => {}
    }

    watcher.stop().await?;
    Ok(())
}
