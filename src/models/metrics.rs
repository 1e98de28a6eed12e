//! Per-domain run metrics.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::BlockKind;

/// Aggregate counters for one domain crawl. One instance per domain per run,
/// finalized exactly once when the run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub domain: String,
    /// Proxy the run started with.
    pub proxy: String,
    /// Driver adapter that produced this run.
    pub crawler_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_duration_seconds: Option<f64>,
    pub pages_crawled: usize,
    pub listings_extracted: usize,
    pub captcha_blocked: bool,
    pub captcha_type: BlockKind,
    /// Listing number the run was blocked at, 0 if never blocked mid-batch.
    pub blocked_at_listing: usize,
    pub proxy_rotations: usize,
    pub proxies_used: Vec<String>,
    pub success_rate: f64,
    pub avg_time_per_listing: f64,
    pub errors: Vec<String>,
    pub detailed_timings: HashMap<String, f64>,
}

impl RunMetrics {
    pub fn new(domain: &str, proxy: &str, crawler_type: &str) -> Self {
        Self {
            domain: domain.to_string(),
            proxy: proxy.to_string(),
            crawler_type: crawler_type.to_string(),
            start_time: Utc::now(),
            end_time: None,
            total_duration_seconds: None,
            pages_crawled: 0,
            listings_extracted: 0,
            captcha_blocked: false,
            captcha_type: BlockKind::None,
            blocked_at_listing: 0,
            proxy_rotations: 0,
            proxies_used: vec![proxy.to_string()],
            success_rate: 0.0,
            avg_time_per_listing: 0.0,
            errors: Vec::new(),
            detailed_timings: HashMap::new(),
        }
    }

    /// Track a proxy that served at least one request during the run.
    pub fn record_proxy(&mut self, proxy: &str) {
        if !self.proxies_used.iter().any(|p| p == proxy) {
            self.proxies_used.push(proxy.to_string());
        }
    }

    pub fn record_error(&mut self, context: impl Into<String>) {
        self.errors.push(context.into());
    }

    pub fn record_timing(&mut self, key: &str, seconds: f64) {
        self.detailed_timings.insert(key.to_string(), seconds);
    }

    pub fn record_block(&mut self, kind: BlockKind, listing_number: usize) {
        self.captcha_blocked = true;
        self.captcha_type = kind;
        if listing_number > 0 && self.blocked_at_listing == 0 {
            self.blocked_at_listing = listing_number;
        }
    }

    /// Close out the run and derive the summary numbers. A second call is a
    /// no-op so the derived values cannot drift after reporting.
    pub fn finalize(&mut self) {
        if self.end_time.is_some() {
            return;
        }
        let end = Utc::now();
        self.end_time = Some(end);

        let duration = (end - self.start_time).num_milliseconds() as f64 / 1000.0;
        self.total_duration_seconds = Some(duration);

        if self.listings_extracted > 0 && duration > 0.0 {
            self.avg_time_per_listing = duration / self.listings_extracted as f64;
        }
        if self.pages_crawled > 0 {
            self.success_rate = self.listings_extracted as f64 / self.pages_crawled as f64;
        }
    }
}
