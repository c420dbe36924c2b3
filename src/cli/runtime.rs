use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::ValueEnum;
use pdfpipe::{AppConfig, LoadedConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Installs the global subscriber. `RUST_LOG` wins over `level`; `debug` forces DEBUG.
/// Logs go to stderr so stdout stays clean for reports.
pub fn init_logging(level: &str, debug: bool, format: LogFormat) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        level.parse().context("Invalid log level")?
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    }
    .context("Failed to install tracing subscriber")?;

    Ok(())
}

pub async fn load_config(config_path: Option<&PathBuf>) -> Result<LoadedConfig> {
    let loaded = AppConfig::load(config_path.map(PathBuf::as_path))
        .await
        .context("Failed to load configuration")?;
    if !loaded.from_file {
        info!(
            "Config file not found, using defaults: {}",
            loaded.path.display()
        );
    }
    Ok(loaded)
}

/// A token cancelled on the first Ctrl-C.
pub fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let watcher = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = watcher.cancelled() => {}
            result = signal::ctrl_c() => match result {
                Ok(()) => {
                    warn!("Interrupted; cancelling");
                    watcher.cancel();
                }
                Err(err) => warn!(?err, "failed to listen for Ctrl-C"),
            },
        }
    });
    token
}
