//! Per-domain crawl orchestration.
//!
//! One domain run: acquire a proxy, open the homepage, land on the
//! inventory, harvest detail URLs across pagination, then hand the
//! listing queue to the batch scheduler. The inventory stage carries a
//! single proxy-rotation retry; a second block ends the run early with
//! the block recorded in the metrics instead of an error bubbling up.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

use crate::browser::{CrawlSession, PageDriver, SessionFactory};
use crate::config::Config;
use crate::detect::{self, BlockVerdict};
use crate::error::{CrawlError, Result};
use crate::harvest;
use crate::models::{RunMetrics, VehicleRecord};
use crate::navigate::{self, LoadPolicy, PageOutcome};
use crate::pacing;
use crate::proxy::ProxyPool;
use crate::schedule::{self, ListingJob, SchedulerSettings};

/// Driver adapter name recorded in run metrics.
const CRAWLER_TYPE: &str = "stealth_chrome";

/// Why the inventory stage failed an attempt.
enum InventoryFailure {
    Blocked(BlockVerdict),
    Failed(String),
}

/// Inventory page reached by one session.
struct InventoryPage {
    html: String,
    url: Url,
}

/// Crawl one dealer domain end to end.
///
/// Always returns finalized metrics, whatever happened; the record list
/// may be empty. Errors inside the run are folded into the metrics so one
/// bad domain never aborts a multi-domain invocation.
pub async fn crawl_domain(
    factory: Arc<dyn SessionFactory>,
    pool: Arc<ProxyPool>,
    domain: &str,
    config: &Config,
) -> (Vec<VehicleRecord>, RunMetrics) {
    let started = Instant::now();
    let mut proxy = pool.acquire();
    let mut metrics = RunMetrics::new(domain, proxy.as_deref().unwrap_or("none"), CRAWLER_TYPE);
    if let Some(ref p) = proxy {
        metrics.record_proxy(p);
    }

    let homepage = match domain_url(domain) {
        Ok(url) => url,
        Err(e) => {
            metrics.record_error(e.to_string());
            metrics.finalize();
            release(&pool, &proxy);
            return (Vec::new(), metrics);
        }
    };

    info!(
        "Crawling {} (proxy: {})",
        domain,
        proxy.as_deref().unwrap_or("none")
    );

    let policy = LoadPolicy::new(&config.crawl, &config.browser);
    let crawl = &config.crawl;

    // One rotation retry at the inventory stage, then the run ends.
    let mut rotations_left = 1;
    let (session, inventory) = loop {
        match open_inventory(factory.as_ref(), proxy.as_deref(), &homepage, &policy).await {
            Ok(pair) => break pair,
            Err(InventoryFailure::Blocked(verdict)) => {
                warn!(
                    "{}: inventory blocked by {} (confidence {:.2})",
                    domain, verdict.kind, verdict.confidence
                );
                metrics.record_block(verdict.kind, 0);
                metrics.record_error(format!("inventory blocked by {}", verdict.kind));
                if !rotate_or_bail(&pool, &mut proxy, &mut metrics, &mut rotations_left) {
                    metrics.finalize();
                    release(&pool, &proxy);
                    return (Vec::new(), metrics);
                }
                pacing::jitter(crawl.cooldown_min_secs, crawl.cooldown_max_secs).await;
            }
            Err(InventoryFailure::Failed(reason)) => {
                warn!("{}: inventory stage failed: {}", domain, reason);
                metrics.record_error(format!("inventory stage: {}", reason));
                if !rotate_or_bail(&pool, &mut proxy, &mut metrics, &mut rotations_left) {
                    metrics.finalize();
                    release(&pool, &proxy);
                    return (Vec::new(), metrics);
                }
                pacing::jitter(crawl.cooldown_min_secs, crawl.cooldown_max_secs).await;
            }
        }
    };

    metrics.pages_crawled += 1;

    let template = harvest::detect_template(&inventory.html);
    info!("{}: template {}", domain, template);

    let harvest_started = Instant::now();
    let (mut urls, pagination) = harvest::harvest_detail_urls(
        session.driver(),
        &inventory.url,
        &inventory.html,
        template,
        &policy,
        crawl.max_pages,
        (crawl.delay_min_secs, crawl.delay_max_secs),
    )
    .await;
    metrics.record_timing("harvest", harvest_started.elapsed().as_secs_f64());

    let walked = pagination.total_pages.min(crawl.max_pages.max(1));
    metrics.pages_crawled += walked.saturating_sub(1);

    // Listing attempts each get a fresh session; this one is done.
    session.close().await;

    if urls.is_empty() {
        warn!("{}: no detail links found", domain);
        metrics.record_error("no detail links found");
        metrics.finalize();
        release(&pool, &proxy);
        return (Vec::new(), metrics);
    }

    if urls.len() > crawl.max_listings {
        info!(
            "{}: capping {} detail links at {}",
            domain,
            urls.len(),
            crawl.max_listings
        );
        urls.truncate(crawl.max_listings);
    }
    info!("{}: processing {} listings", domain, urls.len());

    let jobs: Vec<ListingJob> = urls
        .into_iter()
        .enumerate()
        .map(|(i, url)| ListingJob {
            url,
            listing_number: i + 1,
            domain: domain.to_string(),
            template,
        })
        .collect();

    let shared = Arc::new(Mutex::new(metrics));
    let records = schedule::process_listings(
        Arc::clone(&factory),
        Arc::clone(&pool),
        proxy.clone(),
        jobs,
        &policy,
        &SchedulerSettings::from_crawl(crawl),
        Arc::clone(&shared),
    )
    .await;

    let mut metrics = match Arc::try_unwrap(shared) {
        Ok(inner) => inner.into_inner(),
        Err(shared) => shared.lock().await.clone(),
    };

    release(&pool, &proxy);
    metrics.record_timing("total_crawl", started.elapsed().as_secs_f64());
    metrics.finalize();

    info!(
        "{}: extracted {} record(s) from {} page(s)",
        domain, metrics.listings_extracted, metrics.pages_crawled
    );

    (records, metrics)
}

/// Load just the homepage of `domain` and report how it came back. Used by
/// the CLI block check.
pub async fn check_domain(
    factory: &dyn SessionFactory,
    pool: &ProxyPool,
    domain: &str,
    config: &Config,
) -> Result<PageOutcome> {
    let homepage = domain_url(domain)?;
    let proxy = pool.acquire();
    let policy = LoadPolicy::new(&config.crawl, &config.browser);

    let session = match factory.open(proxy.as_deref()).await {
        Ok(session) => session,
        Err(e) => {
            release(pool, &proxy);
            return Err(e);
        }
    };

    let outcome = navigate::load_page(session.driver(), homepage.as_str(), &policy).await;
    session.close().await;
    release(pool, &proxy);
    outcome
}

/// Rotate to an untried proxy if the budget and the pool allow it.
/// Returns false when the run should end instead of retrying.
fn rotate_or_bail(
    pool: &ProxyPool,
    proxy: &mut Option<String>,
    metrics: &mut RunMetrics,
    rotations_left: &mut usize,
) -> bool {
    if *rotations_left == 0 {
        return false;
    }
    *rotations_left -= 1;

    if pool.is_empty() {
        // No proxies configured; retry with a fresh session only.
        return true;
    }

    let current = proxy.clone().unwrap_or_default();
    match pool.rotate(&current, &[]) {
        Some(next) => {
            metrics.proxy_rotations += 1;
            metrics.record_proxy(&next);
            *proxy = Some(next);
            true
        }
        None => {
            metrics.record_error("proxy pool exhausted at inventory stage");
            *proxy = None;
            false
        }
    }
}

/// Open a session and land on the inventory page.
///
/// Loads the homepage, follows an inventory link when one is present, and
/// returns the session together with the HTML and URL the harvester should
/// start from. The session is closed before returning on every error path.
async fn open_inventory(
    factory: &dyn SessionFactory,
    proxy: Option<&str>,
    homepage: &Url,
    policy: &LoadPolicy,
) -> std::result::Result<(Box<dyn CrawlSession>, InventoryPage), InventoryFailure> {
    let session = match factory.open(proxy).await {
        Ok(session) => session,
        Err(e) => {
            return Err(InventoryFailure::Failed(format!(
                "session open failed: {}",
                e
            )))
        }
    };

    let outcome = match navigate::load_page(session.driver(), homepage.as_str(), policy).await {
        Ok(outcome) => outcome,
        Err(e) => {
            session.close().await;
            return Err(InventoryFailure::Failed(e.to_string()));
        }
    };

    let html = match outcome {
        PageOutcome::Usable { html, .. } => html,
        PageOutcome::Blocked(verdict) => {
            session.close().await;
            return Err(InventoryFailure::Blocked(verdict));
        }
        PageOutcome::Empty { length } => {
            session.close().await;
            return Err(InventoryFailure::Failed(format!(
                "homepage rendered only {} chars",
                length
            )));
        }
    };

    if harvest::enter_inventory(session.driver()).await {
        pacing::jitter(policy.wait_min_secs, policy.wait_max_secs).await;

        let driver = session.driver();
        let entered_html = match driver.content().await {
            Ok(content) => content,
            // keep the homepage if the DOM read failed
            Err(_) => html.clone(),
        };
        let title = navigate::page_title(driver).await;
        let current = current_url(driver, homepage).await;

        let verdict = detect::detect(&entered_html, &title, current.as_str());
        if verdict.is_blocked {
            session.close().await;
            return Err(InventoryFailure::Blocked(verdict));
        }

        return Ok((
            session,
            InventoryPage {
                html: entered_html,
                url: current,
            },
        ));
    }

    Ok((
        session,
        InventoryPage {
            html,
            url: homepage.clone(),
        },
    ))
}

/// Current location of the page, or `fallback` when the DOM cannot be asked.
async fn current_url(driver: &dyn PageDriver, fallback: &Url) -> Url {
    if let Ok(value) = driver.evaluate("window.location.href").await {
        if let Some(href) = value.as_str() {
            if let Ok(url) = Url::parse(href) {
                return url;
            }
        }
    }
    fallback.clone()
}

/// Build the homepage URL for a configured domain entry, accepting either
/// a bare host or a full URL.
fn domain_url(domain: &str) -> Result<Url> {
    let trimmed = domain.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(CrawlError::Config("empty domain".into()));
    }
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    Url::parse(&with_scheme)
        .map_err(|e| CrawlError::Config(format!("invalid domain {}: {}", domain, e)))
}

fn release(pool: &ProxyPool, proxy: &Option<String>) {
    if let Some(p) = proxy {
        pool.release(p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::browser::ElementDriver;
    use crate::config::CrawlSettings;
    use crate::detect::BlockKind;
    use crate::error::Result as CrawlResult;
    use crate::models::TemplateType;

    type Pages = HashMap<String, String>;

    struct MockDriver {
        pages: Pages,
        current: StdMutex<String>,
    }

    #[async_trait]
    impl PageDriver for MockDriver {
        async fn navigate(&self, url: &str) -> CrawlResult<()> {
            *self.current.lock().unwrap() = url.to_string();
            Ok(())
        }

        async fn content(&self) -> CrawlResult<String> {
            let current = self.current.lock().unwrap().clone();
            Ok(self.pages.get(&current).cloned().unwrap_or_default())
        }

        async fn evaluate(&self, script: &str) -> CrawlResult<Value> {
            if script.contains("readyState") {
                return Ok(Value::String("complete".into()));
            }
            if script == "document.title" {
                return Ok(Value::String(String::new()));
            }
            if script == "window.location.href" {
                return Ok(Value::String(self.current.lock().unwrap().clone()));
            }
            Ok(Value::Null)
        }

        async fn select_all(&self, _selector: &str) -> CrawlResult<Vec<Box<dyn ElementDriver>>> {
            Ok(Vec::new())
        }

        async fn close(&self) -> CrawlResult<()> {
            Ok(())
        }
    }

    struct MockSession {
        driver: MockDriver,
    }

    #[async_trait]
    impl CrawlSession for MockSession {
        fn driver(&self) -> &dyn PageDriver {
            &self.driver
        }

        fn proxy(&self) -> Option<&str> {
            None
        }

        fn user_agent(&self) -> &str {
            "test-agent"
        }

        async fn close(self: Box<Self>) {}
    }

    /// One pages map per successive open; the last map repeats.
    struct MockFactory {
        sessions: StdMutex<VecDeque<Pages>>,
        fallback: Pages,
        opens: AtomicUsize,
    }

    impl MockFactory {
        fn serving(sessions: Vec<Pages>) -> Arc<Self> {
            let fallback = sessions.last().cloned().unwrap_or_default();
            Arc::new(Self {
                sessions: StdMutex::new(sessions.into_iter().collect()),
                fallback,
                opens: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SessionFactory for MockFactory {
        async fn open(&self, _proxy: Option<&str>) -> CrawlResult<Box<dyn CrawlSession>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let pages = self
                .sessions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            Ok(Box::new(MockSession {
                driver: MockDriver {
                    pages,
                    current: StdMutex::new(String::new()),
                },
            }))
        }
    }

    fn inventory_page(base: &str) -> String {
        let filler = "Family owned and operated since 1987 with a large selection. ".repeat(40);
        format!(
            "<html><head><title>Example Motors</title></head><body>\
             <p>Search Inventory</p>\
             <p>Showing 1 - 2 of 2</p>\
             <a href=\"{}/Inventory/Details/1\">2021 Honda Accord EX</a>\
             <a href=\"{}/Inventory/Details/2\">2022 Honda Accord EX</a>\
             <p>{}</p></body></html>",
            base, base, filler
        )
    }

    fn listing_page(n: usize) -> String {
        let filler = "Clean local trade with service records available on request. ".repeat(60);
        format!(
            "<html><head><title>Listing</title></head><body>\
             <h1 class=\"vehicle-title\">202{} Honda Accord EX</h1>\
             <div class=\"price\">$21,500</div>\
             <div class=\"mileage\">40,1{}2 miles</div>\
             <p>{}</p></body></html>",
            n, n, filler
        )
    }

    fn hcaptcha_page() -> String {
        concat!(
            "<html><head><title>Just a moment</title></head><body>",
            "<script src=\"https://hcaptcha.com/1/api.js\" async defer></script>",
            "<div class=\"h-captcha\" data-sitekey=\"10000000-ffff-ffff-ffff-000000000001\">",
            "</div></body></html>"
        )
        .to_string()
    }

    fn fast_config() -> Config {
        Config {
            crawl: CrawlSettings {
                batch_size: 2,
                max_retries: 2,
                delay_min_secs: 0.0,
                delay_max_secs: 0.0,
                reading_min_secs: 0.0,
                reading_max_secs: 0.0,
                cooldown_min_secs: 0.0,
                cooldown_max_secs: 0.0,
                stagger_min_secs: 0.0,
                stagger_max_secs: 0.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_domain_url_normalizes() {
        assert_eq!(
            domain_url("dealer.example").unwrap().as_str(),
            "https://dealer.example/"
        );
        assert_eq!(
            domain_url("http://dealer.example/").unwrap().as_str(),
            "http://dealer.example/"
        );
        assert!(domain_url("").is_err());
    }

    #[tokio::test]
    async fn test_crawl_domain_end_to_end() {
        let base = "https://dealer.example";
        let mut pages = Pages::new();
        pages.insert(format!("{}/", base), inventory_page(base));
        pages.insert(format!("{}/Inventory/Details/1", base), listing_page(1));
        pages.insert(format!("{}/Inventory/Details/2", base), listing_page(2));

        let factory = MockFactory::serving(vec![pages]);
        let pool = Arc::new(ProxyPool::new(Vec::new()));

        let (records, metrics) =
            crawl_domain(factory.clone(), pool, "dealer.example", &fast_config()).await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].listing_number, 1);
        assert_eq!(records[0].fields.title, "2021 Honda Accord EX");
        assert_eq!(records[1].fields.title, "2022 Honda Accord EX");
        assert_eq!(records[0].template_type, TemplateType::Template1);
        assert_eq!(records[0].proxy_used, "none");

        assert_eq!(metrics.pages_crawled, 3);
        assert_eq!(metrics.listings_extracted, 2);
        assert!(metrics.end_time.is_some());
        assert!(!metrics.captcha_blocked);
        // inventory session plus one per listing
        assert_eq!(factory.opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_inventory_block_rotates_and_recovers() {
        let base = "https://dealer.example";
        let mut blocked = Pages::new();
        blocked.insert(format!("{}/", base), hcaptcha_page());

        let mut good = Pages::new();
        good.insert(format!("{}/", base), inventory_page(base));
        good.insert(format!("{}/Inventory/Details/1", base), listing_page(1));
        good.insert(format!("{}/Inventory/Details/2", base), listing_page(2));

        let factory = MockFactory::serving(vec![blocked, good]);
        let pool = Arc::new(ProxyPool::new(vec![
            "http://p1:8080".to_string(),
            "http://p2:8080".to_string(),
        ]));

        let (records, metrics) = crawl_domain(
            factory.clone(),
            Arc::clone(&pool),
            "dealer.example",
            &fast_config(),
        )
        .await;

        assert_eq!(records.len(), 2);
        assert!(metrics.captcha_blocked);
        assert_eq!(metrics.captcha_type, BlockKind::Hcaptcha);
        assert_eq!(metrics.blocked_at_listing, 0);
        assert_eq!(metrics.proxy_rotations, 1);
        assert_eq!(metrics.proxies_used.len(), 2);
        assert_eq!(factory.opens.load(Ordering::SeqCst), 4);
        // every proxy is back once the run ends
        assert_eq!(pool.available().len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_inventory_block_ends_run() {
        let base = "https://dealer.example";
        let mut blocked = Pages::new();
        blocked.insert(format!("{}/", base), hcaptcha_page());

        let factory = MockFactory::serving(vec![blocked]);
        let pool = Arc::new(ProxyPool::new(vec![
            "http://p1:8080".to_string(),
            "http://p2:8080".to_string(),
        ]));

        let (records, metrics) =
            crawl_domain(factory.clone(), pool, "dealer.example", &fast_config()).await;

        assert!(records.is_empty());
        assert!(metrics.captcha_blocked);
        assert!(metrics.end_time.is_some());
        assert_eq!(metrics.proxy_rotations, 1);
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_links_recorded_as_error() {
        let base = "https://dealer.example";
        let filler = "Welcome to our family dealership serving the whole county. ".repeat(40);
        let mut pages = Pages::new();
        pages.insert(
            format!("{}/", base),
            format!(
                "<html><body><p>Search Inventory</p><p>{}</p></body></html>",
                filler
            ),
        );

        let factory = MockFactory::serving(vec![pages]);
        let pool = Arc::new(ProxyPool::new(Vec::new()));

        let (records, metrics) =
            crawl_domain(factory, pool, "dealer.example", &fast_config()).await;

        assert!(records.is_empty());
        assert!(metrics.errors.iter().any(|e| e.contains("no detail links")));
        assert!(metrics.end_time.is_some());
    }

    #[tokio::test]
    async fn test_check_domain_reports_blocked() {
        let base = "https://dealer.example";
        let mut blocked = Pages::new();
        blocked.insert(format!("{}/", base), hcaptcha_page());

        let factory = MockFactory::serving(vec![blocked]);
        let pool = ProxyPool::new(Vec::new());

        let outcome = check_domain(factory.as_ref(), &pool, "dealer.example", &fast_config())
            .await
            .unwrap();
        match outcome {
            PageOutcome::Blocked(verdict) => assert_eq!(verdict.kind, BlockKind::Hcaptcha),
            other => panic!("expected blocked outcome, got {:?}", other),
        }
    }
}
