//! # Danmu Server
//!
//! Room-scoped danmu relay over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file in the working directory
//! danmu
//!
//! # Run with environment variables
//! DANMU_JWT_SECRET=change-me DANMU_PORT=8080 DANMU_HOST=0.0.0.0 danmu
//! ```
//!
//! Clients connect to `ws://<host>:<port>/ws/danmu/<room>/<connection>`.

mod auth;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "danmu=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;
    config.validate()?;

    tracing::info!("Starting danmu server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
