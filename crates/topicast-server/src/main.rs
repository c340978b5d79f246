//! # topicast server
//!
//! Topic-based pub/sub broker over HTTP and WebSocket.
//!
//! Producers POST JSON to `/publish?topic=NAME`; consumers open a
//! WebSocket to `/subscribe?topic=NAME` and receive every message
//! published to the topic after they attach.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! topicast
//!
//! # Run with custom config
//! topicast --config /path/to/topicast.toml
//!
//! # Run with environment variables
//! TOPICAST_PORT=8081 TOPICAST_HOST=0.0.0.0 topicast
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "topicast=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let args: Vec<String> = std::env::args().collect();
    let config = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config requires a path")?;
            config::Config::from_file(path)?
        }
        None => config::Config::load()?,
    };

    tracing::info!(
        "Starting topicast server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
