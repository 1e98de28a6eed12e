//! lotscrape - car-dealer inventory crawler.
//!
//! Drives a stealth Chrome session through dealer inventory sites, detects
//! captcha and block interstitials, rotates proxies on failure, and exports
//! the extracted vehicle records.

mod browser;
mod cli;
mod config;
mod crawler;
mod detect;
mod error;
mod export;
mod extract;
mod harvest;
mod models;
mod navigate;
mod pacing;
mod proxy;
mod schedule;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "lots=info"
    } else {
        "lots=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Run CLI
    cli::run().await
}
