//! Meshwork signaling relay
//!
//! A small rendezvous service agents use to exchange handshake messages
//! before a direct tunnel exists. Stateless apart from one pending message
//! slot per channel; run it anywhere both peers can reach.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Meshwork signaling relay
#[derive(Parser)]
#[command(name = "meshwork-signal-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen port
    #[arg(short, long, default_value = "8080", env = "PORT")]
    port: u16,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("binding port {}", cli.port))?;
    info!(port = cli.port, "signaling relay listening");

    axum::serve(listener, meshwork_signal::relay::router())
        .await
        .context("relay server failed")?;
    Ok(())
}
