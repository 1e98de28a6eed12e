//! Page-load controller.
//!
//! Drives a page through navigate, settle, and verify, and reduces every
//! load to a [`PageOutcome`] the retry machinery can act on. Navigation
//! and content failures surface as errors; blocks and thin pages are
//! ordinary outcomes.

use std::time::Duration;

use tracing::{debug, warn};

use crate::browser::{PageDriver, STEALTH_SCRIPTS};
use crate::config::{BrowserSettings, CrawlSettings};
use crate::detect::{self, BlockVerdict};
use crate::error::Result;
use crate::pacing;

/// Promise that resolves once the document reaches a ready state, with an
/// in-page fallback so evaluation cannot hang on pages that never settle.
const READY_STATE_SCRIPT: &str = r#"
    new Promise((resolve) => {
        if (document.readyState === 'complete' || document.readyState === 'interactive') {
            resolve(document.readyState);
        } else {
            document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
            setTimeout(() => resolve('timeout'), 10000);
        }
    })
"#;

/// What a single page load reduced to.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    /// Readable page with enough content to work with.
    Usable { html: String, title: String },
    /// A block or challenge interstitial.
    Blocked(BlockVerdict),
    /// Loaded but too small to trust, even when the verdict is clear.
    Empty { length: usize },
}

/// Load behavior derived from configuration.
#[derive(Debug, Clone)]
pub struct LoadPolicy {
    pub wait_min_secs: f64,
    pub wait_max_secs: f64,
    /// Pause band for the on-page reading simulation.
    pub reading_min_secs: f64,
    pub reading_max_secs: f64,
    pub ready_timeout_secs: u64,
    pub min_content_length: usize,
}

impl LoadPolicy {
    pub fn new(crawl: &CrawlSettings, browser: &BrowserSettings) -> Self {
        Self {
            wait_min_secs: crawl.delay_min_secs,
            wait_max_secs: crawl.delay_max_secs,
            reading_min_secs: crawl.reading_min_secs,
            reading_max_secs: crawl.reading_max_secs,
            ready_timeout_secs: browser.timeout,
            min_content_length: crawl.min_content_length,
        }
    }
}

/// Load `url` and classify what came back.
pub async fn load_page(
    driver: &dyn PageDriver,
    url: &str,
    policy: &LoadPolicy,
) -> Result<PageOutcome> {
    driver.navigate(url).await?;

    pacing::jitter(policy.wait_min_secs, policy.wait_max_secs).await;

    wait_for_ready(driver, policy.ready_timeout_secs).await;

    apply_stealth(driver).await;

    // Read like a person before pulling the DOM; challenge vendors score
    // the absence of pointer activity as much as its shape.
    pacing::simulate_reading(driver, (policy.reading_min_secs, policy.reading_max_secs)).await;

    let html = driver.content().await?;
    let title = page_title(driver).await;

    // A positive verdict wins over the length check so short challenge
    // interstitials are still attributed to their vendor.
    let verdict = detect::detect(&html, &title, url);
    if verdict.is_blocked {
        warn!(
            "Blocked at {} ({}, confidence {:.2})",
            url, verdict.kind, verdict.confidence
        );
        return Ok(PageOutcome::Blocked(verdict));
    }

    if html.len() < policy.min_content_length {
        debug!("Thin page at {} ({} bytes)", url, html.len());
        return Ok(PageOutcome::Empty { length: html.len() });
    }

    Ok(PageOutcome::Usable { html, title })
}

async fn wait_for_ready(driver: &dyn PageDriver, timeout_secs: u64) {
    let ready_timeout = Duration::from_secs(timeout_secs);
    match tokio::time::timeout(ready_timeout, driver.evaluate(READY_STATE_SCRIPT)).await {
        Ok(Ok(value)) => {
            let state = value.as_str().unwrap_or("unknown").to_string();
            debug!("Page ready state: {}", state);
            if state != "complete" && state != "interactive" {
                // one bounded extra settle for documents that reported late
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
        Ok(Err(e)) => {
            debug!("Could not check ready state: {}", e);
        }
        Err(_) => {
            warn!("Timeout waiting for page ready state");
        }
    }
}

/// Apply fingerprint evasion to the loaded document, best effort.
async fn apply_stealth(driver: &dyn PageDriver) {
    for script in STEALTH_SCRIPTS {
        if let Err(e) = driver.evaluate(script).await {
            debug!("Stealth script injection skipped: {}", e);
        }
    }
}

pub(crate) async fn page_title(driver: &dyn PageDriver) -> String {
    match driver.evaluate("document.title").await {
        Ok(value) => value.as_str().unwrap_or_default().to_string(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::ElementDriver;
    use crate::detect::BlockKind;
    use crate::error::CrawlError;
    use async_trait::async_trait;
    use serde_json::Value;

    struct MockDriver {
        html: String,
        title: String,
        fail_navigation: bool,
    }

    impl MockDriver {
        fn new(html: &str, title: &str) -> Self {
            Self {
                html: html.to_string(),
                title: title.to_string(),
                fail_navigation: false,
            }
        }
    }

    #[async_trait]
    impl PageDriver for MockDriver {
        async fn navigate(&self, url: &str) -> crate::error::Result<()> {
            if self.fail_navigation {
                return Err(CrawlError::Navigation {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(())
        }

        async fn content(&self) -> crate::error::Result<String> {
            Ok(self.html.clone())
        }

        async fn evaluate(&self, script: &str) -> crate::error::Result<Value> {
            if script.contains("readyState") {
                return Ok(Value::String("complete".to_string()));
            }
            if script == "document.title" {
                return Ok(Value::String(self.title.clone()));
            }
            Ok(Value::Null)
        }

        async fn select_all(
            &self,
            _selector: &str,
        ) -> crate::error::Result<Vec<Box<dyn ElementDriver>>> {
            Ok(Vec::new())
        }

        async fn close(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn fast_policy() -> LoadPolicy {
        LoadPolicy {
            wait_min_secs: 0.0,
            wait_max_secs: 0.0,
            reading_min_secs: 0.0,
            reading_max_secs: 0.0,
            ready_timeout_secs: 2,
            min_content_length: 1200,
        }
    }

    fn benign_page(len: usize) -> String {
        let mut html = String::from(
            "<html><head><title>Used Cars</title></head><body><h1>Inventory</h1><p>",
        );
        while html.len() < len {
            html.push_str("Browse our selection of quality pre-owned vehicles today. ");
        }
        html.push_str("</p></body></html>");
        html
    }

    #[tokio::test]
    async fn test_usable_page() {
        let driver = MockDriver::new(&benign_page(3000), "Used Cars");
        let outcome = load_page(&driver, "https://dealer.example.com", &fast_policy())
            .await
            .unwrap();
        match outcome {
            PageOutcome::Usable { html, title } => {
                assert!(html.len() >= 1200);
                assert_eq!(title, "Used Cars");
            }
            other => panic!("expected usable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blocked_page() {
        let html = r#"<html><head><title>Verify</title>
            <script src="https://js.hcaptcha.com/1/api.js" async defer></script>
            </head><body><div class="h-captcha" data-sitekey="key"></div></body></html>"#;
        let driver = MockDriver::new(html, "Verify");
        let outcome = load_page(&driver, "https://dealer.example.com", &fast_policy())
            .await
            .unwrap();
        match outcome {
            PageOutcome::Blocked(verdict) => {
                assert_eq!(verdict.kind, BlockKind::Hcaptcha);
                assert!(verdict.confidence >= 0.9);
            }
            other => panic!("expected blocked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_thin_page_is_empty_not_trusted() {
        let driver = MockDriver::new(&benign_page(300), "Used Cars");
        let outcome = load_page(&driver, "https://dealer.example.com", &fast_policy())
            .await
            .unwrap();
        match outcome {
            PageOutcome::Empty { length } => assert!(length < 1200),
            other => panic!("expected empty, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_challenge_still_classified_blocked() {
        // under min_content_length, but the verdict wins
        let html = "<html><body>Access denied. #cmsg{animation: fadein}</body></html>";
        let driver = MockDriver::new(html, "Access Denied");
        let outcome = load_page(&driver, "https://dealer.example.com/blocked", &fast_policy())
            .await
            .unwrap();
        assert!(matches!(outcome, PageOutcome::Blocked(_)));
    }

    #[tokio::test]
    async fn test_navigation_error_propagates() {
        let mut driver = MockDriver::new("<html></html>", "");
        driver.fail_navigation = true;
        let err = load_page(&driver, "https://dealer.example.com", &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Navigation { .. }));
    }
}
