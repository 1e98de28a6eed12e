//! Crawl error types.
//!
//! Transport and environment failures only. Blocks, extraction misses,
//! and pool exhaustion are expected outcomes of crawling hostile sites,
//! so they travel as data (`PageOutcome`, attempt results) rather than
//! errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Session could not be opened: {0}")]
    Session(String),
    #[error("Navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },
    #[error("Browser driver error: {0}")]
    Driver(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV export error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, CrawlError>;
