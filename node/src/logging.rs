//! Tracing setup for the node binary.
//!
//! Output goes to stderr; stdout is reserved for what `status` and `keygen`
//! print. `RUST_LOG` takes precedence over `--log-level`.

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Multi-line human output with source locations.
    Pretty,
    /// Single-line human output.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Builds the filter from `RUST_LOG`, falling back to `default_level`.
fn filter(default_level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_level)
            .map_err(|e| anyhow!("invalid log filter {default_level:?}: {e}")),
    }
}

/// Installs the global subscriber. Fails if one is already set or the
/// filter does not parse.
///
/// ```text
/// RUST_LOG=triad_node=debug,triad_protocol::network=trace triad-node run
/// ```
pub fn init_logging(default_level: &str, format: LogFormat) -> Result<()> {
    let registry = tracing_subscriber::registry().with(filter(default_level)?);
    let installed = match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(false),
            )
            .try_init(),
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::debug!(?format, "logging initialized");
    Ok(())
}
