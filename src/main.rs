//! src/main.rs
//!
//! The entrypoint for the `netsim` binary. Picks a mode from the first
//! argument, loads configuration and hands off to [`App`].

use anyhow::Context;
use gossip_netsim::{App, Config, Mode};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the TAP stream.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mode: Mode = std::env::args()
        .nth(1)
        .as_deref()
        .unwrap_or("run")
        .parse()?;
    let config = Config::load().context("Failed to load configuration")?;

    let app = App::new(config)?;
    if let Err(e) = app.run(mode).await {
        tracing::error!(error = %e, "💥 netsim failed");
        std::process::exit(1);
    }
    Ok(())
}
