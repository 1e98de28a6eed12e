//! Bounded-concurrency batch scheduler for detail pages.
//!
//! Listings are processed in fixed-size batches. Each batch spawns one
//! task per URL with a small random stagger, and the next batch does not
//! start until every task in the current one has finished, so peak
//! session and proxy usage never exceeds the batch size. Every attempt
//! opens a fresh session; a blocked attempt rotates to a proxy the
//! listing has not tried before retrying.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::browser::{CrawlSession, PageDriver, SessionFactory};
use crate::config::CrawlSettings;
use crate::detect::{self, BlockKind, BlockVerdict};
use crate::extract;
use crate::models::{RunMetrics, TemplateType, VehicleRecord};
use crate::navigate::{self, LoadPolicy, PageOutcome};
use crate::pacing;
use crate::proxy::ProxyPool;

/// One detail page queued for processing.
#[derive(Debug, Clone)]
pub struct ListingJob {
    pub url: String,
    /// 1-based position in the harvested listing order.
    pub listing_number: usize,
    pub domain: String,
    pub template: TemplateType,
}

/// Outcome of a single attempt at one listing.
#[derive(Debug)]
pub enum AttemptResult {
    /// A record was extracted.
    Success(Box<VehicleRecord>),
    /// The page was classified as blocked.
    Blocked(BlockVerdict),
    /// The session could not be opened or the page could not be loaded.
    NavigationFailed(String),
    /// The page rendered fine but no record could be derived from it.
    ExtractionMiss,
}

/// Whether `result` warrants another attempt.
///
/// Success is terminal, and so is a clean extraction miss: reloading a
/// malformed page yields the same malformed page. Blocks and transport
/// failures retry while the attempt budget lasts.
pub fn should_retry(result: &AttemptResult, attempt: usize, max_retries: usize) -> bool {
    match result {
        AttemptResult::Success(_) | AttemptResult::ExtractionMiss => false,
        AttemptResult::Blocked(_) | AttemptResult::NavigationFailed(_) => attempt < max_retries,
    }
}

/// Pacing and retry knobs for one scheduler run.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub max_retries: usize,
    /// Delay band before each task spawn within a batch.
    pub stagger: (f64, f64),
    /// Delay band between batches.
    pub cooldown: (f64, f64),
    /// Delay band for on-page dwell and inter-attempt pauses.
    pub reading: (f64, f64),
}

impl SchedulerSettings {
    pub fn from_crawl(crawl: &CrawlSettings) -> Self {
        Self {
            batch_size: crawl.batch_size.max(1),
            max_retries: crawl.max_retries.max(1),
            stagger: (crawl.stagger_min_secs, crawl.stagger_max_secs),
            cooldown: (crawl.cooldown_min_secs, crawl.cooldown_max_secs),
            reading: (crawl.reading_min_secs, crawl.reading_max_secs),
        }
    }
}

/// Process `jobs` in batches, returning extracted records in listing order.
///
/// `initial_proxy` is where every listing starts; retries rotate away from
/// it independently per listing. Individual failures land in `metrics` and
/// never abort the run or cancel sibling tasks.
pub async fn process_listings(
    factory: Arc<dyn SessionFactory>,
    pool: Arc<ProxyPool>,
    initial_proxy: Option<String>,
    jobs: Vec<ListingJob>,
    policy: &LoadPolicy,
    settings: &SchedulerSettings,
    metrics: Arc<Mutex<RunMetrics>>,
) -> Vec<VehicleRecord> {
    let batch_size = settings.batch_size.max(1);
    let total_batches = jobs.len().div_ceil(batch_size);
    let mut records: Vec<VehicleRecord> = Vec::with_capacity(jobs.len());
    let pb = create_progress_bar(jobs.len() as u64);

    for (batch_index, batch) in jobs.chunks(batch_size).enumerate() {
        if batch_index > 0 {
            debug!("Cooling down before batch {}", batch_index + 1);
            pacing::jitter(settings.cooldown.0, settings.cooldown.1).await;
        }

        info!(
            "Processing batch {}/{} ({} listings)",
            batch_index + 1,
            total_batches,
            batch.len()
        );

        let mut handles = Vec::with_capacity(batch.len());
        for job in batch.iter().cloned() {
            // Stagger spawns so a batch does not open all its sessions at once.
            pacing::jitter(settings.stagger.0, settings.stagger.1).await;

            pb.set_message(format!("listing {}", job.listing_number));
            let factory = Arc::clone(&factory);
            let pool = Arc::clone(&pool);
            let proxy = initial_proxy.clone();
            let policy = policy.clone();
            let settings = settings.clone();
            let metrics = Arc::clone(&metrics);
            handles.push(tokio::spawn(async move {
                run_listing(&*factory, &pool, proxy, job, &policy, &settings, &metrics).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Some(record)) => records.push(*record),
                Ok(None) => {}
                Err(e) => {
                    warn!("Listing task aborted: {}", e);
                    metrics
                        .lock()
                        .await
                        .record_error(format!("listing task aborted: {}", e));
                }
            }
            pb.inc(1);
        }
    }

    pb.finish_and_clear();
    records.sort_by_key(|r| r.listing_number);
    records
}

fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Attempt loop for one listing. Returns the record on success, None once
/// the budget or the proxy pool is exhausted.
async fn run_listing(
    factory: &dyn SessionFactory,
    pool: &ProxyPool,
    initial_proxy: Option<String>,
    job: ListingJob,
    policy: &LoadPolicy,
    settings: &SchedulerSettings,
    metrics: &Mutex<RunMetrics>,
) -> Option<Box<VehicleRecord>> {
    let mut proxy = initial_proxy;
    let mut tried: Vec<String> = proxy.iter().cloned().collect();

    for attempt in 1..=settings.max_retries {
        if let Some(ref p) = proxy {
            metrics.lock().await.record_proxy(p);
        }

        let started = Instant::now();
        let result = attempt_listing(factory, proxy.as_deref(), &job, policy, settings).await;
        let retry = should_retry(&result, attempt, settings.max_retries);

        match result {
            AttemptResult::Success(record) => {
                info!(
                    "Listing {} extracted on attempt {}",
                    job.listing_number, attempt
                );
                let mut m = metrics.lock().await;
                m.pages_crawled += 1;
                m.listings_extracted += 1;
                m.record_timing(
                    &format!("listing_{}", job.listing_number),
                    started.elapsed().as_secs_f64(),
                );
                drop(m);
                if let Some(ref p) = proxy {
                    pool.release(p);
                }
                return Some(record);
            }
            AttemptResult::Blocked(verdict) => {
                warn!(
                    "Listing {} blocked by {} (confidence {:.2}) on attempt {}/{}",
                    job.listing_number,
                    verdict.kind,
                    verdict.confidence,
                    attempt,
                    settings.max_retries
                );
                let mut m = metrics.lock().await;
                m.pages_crawled += 1;
                m.record_block(verdict.kind, job.listing_number);
                m.record_error(format!(
                    "listing {}: blocked by {}",
                    job.listing_number, verdict.kind
                ));
            }
            AttemptResult::NavigationFailed(reason) => {
                warn!(
                    "Listing {} attempt {}/{}: {}",
                    job.listing_number, attempt, settings.max_retries, reason
                );
                metrics
                    .lock()
                    .await
                    .record_error(format!("listing {}: {}", job.listing_number, reason));
            }
            AttemptResult::ExtractionMiss => {
                debug!(
                    "Listing {} has no extractable record; skipping",
                    job.listing_number
                );
                let mut m = metrics.lock().await;
                m.pages_crawled += 1;
                m.record_error(format!(
                    "listing {}: no extractable record",
                    job.listing_number
                ));
            }
        }

        if !retry {
            break;
        }

        if !pool.is_empty() {
            let current = proxy.clone().unwrap_or_default();
            match pool.rotate(&current, &tried) {
                Some(next) => {
                    metrics.lock().await.proxy_rotations += 1;
                    tried.push(next.clone());
                    proxy = Some(next);
                }
                None => {
                    warn!(
                        "Proxy pool exhausted; abandoning listing {}",
                        job.listing_number
                    );
                    metrics.lock().await.record_error(format!(
                        "listing {}: proxy pool exhausted",
                        job.listing_number
                    ));
                    proxy = None;
                    break;
                }
            }
        }

        pacing::jitter(settings.reading.0, settings.reading.1).await;
    }

    if let Some(ref p) = proxy {
        pool.release(p);
    }
    None
}

/// One attempt: fresh session, load, read, extract. The session is closed
/// on every path before the result is returned.
async fn attempt_listing(
    factory: &dyn SessionFactory,
    proxy: Option<&str>,
    job: &ListingJob,
    policy: &LoadPolicy,
    settings: &SchedulerSettings,
) -> AttemptResult {
    let session = match factory.open(proxy).await {
        Ok(session) => session,
        Err(e) => return AttemptResult::NavigationFailed(format!("session open failed: {}", e)),
    };

    let result = visit_and_extract(session.driver(), proxy, job, policy, settings).await;
    session.close().await;
    result
}

async fn visit_and_extract(
    driver: &dyn PageDriver,
    proxy: Option<&str>,
    job: &ListingJob,
    policy: &LoadPolicy,
    settings: &SchedulerSettings,
) -> AttemptResult {
    let outcome = match navigate::load_page(driver, &job.url, policy).await {
        Ok(outcome) => outcome,
        Err(e) => return AttemptResult::NavigationFailed(e.to_string()),
    };

    let html = match outcome {
        PageOutcome::Usable { html, .. } => html,
        PageOutcome::Blocked(verdict) => return AttemptResult::Blocked(verdict),
        PageOutcome::Empty { length } => {
            debug!(
                "Listing {} rendered only {} chars; waiting for late content",
                job.listing_number, length
            );
            match recheck_after_wait(driver, &job.url, policy, settings).await {
                Ok(html) => html,
                Err(verdict) => return AttemptResult::Blocked(verdict),
            }
        }
    };

    match extract::extract(&html, job.template) {
        Some(fields) => {
            let record = VehicleRecord::new(
                job.url.clone(),
                job.listing_number,
                proxy.map(str::to_string).unwrap_or_else(|| "none".into()),
                job.domain.clone(),
                job.template,
                fields,
            );
            AttemptResult::Success(Box::new(record))
        }
        None => AttemptResult::ExtractionMiss,
    }
}

/// Extended wait for late-rendering pages: dwell like a reader, then pull
/// the DOM again and re-verify. A page that stays empty is treated as a
/// block, since the session is burned either way.
async fn recheck_after_wait(
    driver: &dyn PageDriver,
    url: &str,
    policy: &LoadPolicy,
    settings: &SchedulerSettings,
) -> std::result::Result<String, BlockVerdict> {
    pacing::simulate_reading(driver, settings.reading).await;
    pacing::jitter(settings.reading.0, settings.reading.1).await;

    let still_empty = BlockVerdict {
        is_blocked: true,
        kind: BlockKind::Unknown,
        confidence: 0.5,
    };

    let html = match driver.content().await {
        Ok(html) => html,
        Err(_) => return Err(still_empty),
    };
    let title = navigate::page_title(driver).await;

    let verdict = detect::detect(&html, &title, url);
    if verdict.is_blocked {
        return Err(verdict);
    }
    if html.len() < policy.min_content_length {
        return Err(still_empty);
    }
    Ok(html)
}
