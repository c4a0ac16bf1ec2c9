//! Beacon signaling relay -- presence and WebRTC negotiation relay.
//!
//! An axum WebSocket server that lets peer devices discover each other's
//! presence and exchange session-description offers, answers, and ICE
//! candidates. The relay never inspects message bodies -- it only reads
//! routing metadata.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:3001
//! cargo run --bin beacon-relay
//!
//! # Run on custom address
//! cargo run --bin beacon-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! BEACON_ADDR=127.0.0.1:8080 cargo run --bin beacon-relay
//! ```

use beacon_relay::config::{RelayCliArgs, RelayConfig};
use beacon_relay::relay;
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting beacon signaling relay");

    if let Err(e) = relay::run(config).await {
        tracing::error!(error = %e, "signaling relay failed");
        std::process::exit(1);
    }
}
