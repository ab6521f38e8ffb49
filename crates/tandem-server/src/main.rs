//! # Tandem Server
//!
//! WebRTC signaling relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tandem
//!
//! # Run with a config file in the working directory
//! cp tandem.example.toml tandem.toml && tandem
//!
//! # Run with environment variables
//! TANDEM__PORT=8080 TANDEM__AUTH__JWT_SECRET=s3cret tandem
//! ```

use anyhow::Result;
use tandem_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting Tandem server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
