//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;

use crate::browser::{ChromeSessionFactory, SessionFactory};
use crate::config::Config;
use crate::crawler;
use crate::export::{self, ExportPaths};
use crate::models::RunMetrics;
use crate::navigate::PageOutcome;
use crate::pacing;
use crate::proxy::ProxyPool;

#[derive(Parser)]
#[command(name = "lots")]
#[command(about = "Car-dealer inventory crawler with block detection and proxy rotation")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: lots.toml, then config/lots.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl dealer inventories and export the extracted records
    Crawl {
        /// Dealer domains to crawl (overrides configuration)
        #[arg(short, long, value_delimiter = ',')]
        domains: Vec<String>,

        /// Proxy URLs to rotate through (overrides configuration)
        #[arg(short, long, value_delimiter = ',')]
        proxies: Vec<String>,

        /// Maximum detail pages per domain
        #[arg(long)]
        max_listings: Option<usize>,

        /// Concurrent browser sessions per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Attempts per listing before it is skipped
        #[arg(long)]
        max_retries: Option<usize>,

        /// Force headless Chrome
        #[arg(long, conflicts_with = "no_headless")]
        headless: bool,

        /// Run Chrome with a visible window
        #[arg(long)]
        no_headless: bool,

        /// Directory for exported results
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Crawl domains one at a time or several at once
        #[arg(long, value_enum, default_value = "sequential")]
        mode: CrawlMode,

        /// Concurrent domains in parallel mode
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Probe domain homepages and report block verdicts
    Check {
        /// Domains to probe (defaults to configured domains)
        domains: Vec<String>,

        /// Proxy URLs to draw from while probing
        #[arg(short, long, value_delimiter = ',')]
        proxies: Vec<String>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CrawlMode {
    /// One domain at a time with a pause between domains
    Sequential,
    /// Several domains at once, bounded by --max-parallel
    Parallel,
}

/// Parse arguments and dispatch to the command handlers.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Crawl {
            domains,
            proxies,
            max_listings,
            batch_size,
            max_retries,
            headless,
            no_headless,
            output,
            mode,
            max_parallel,
        } => {
            if !domains.is_empty() {
                config.domains = domains;
            }
            if !proxies.is_empty() {
                config.proxies = proxies;
            }
            if let Some(n) = max_listings {
                config.crawl.max_listings = n;
            }
            if let Some(n) = batch_size {
                config.crawl.batch_size = n;
            }
            if let Some(n) = max_retries {
                config.crawl.max_retries = n;
            }
            if headless {
                config.browser.headless = true;
            }
            if no_headless {
                config.browser.headless = false;
            }
            if let Some(dir) = output {
                config.output.dir = dir;
            }
            if let Some(n) = max_parallel {
                config.crawl.max_parallel = n;
            }
            cmd_crawl(config, mode).await
        }
        Commands::Check { domains, proxies } => {
            if !domains.is_empty() {
                config.domains = domains;
            }
            if !proxies.is_empty() {
                config.proxies = proxies;
            }
            cmd_check(config).await
        }
        Commands::Config => cmd_config(&config),
    }
}

/// Crawl every configured domain and export per-domain results.
async fn cmd_crawl(config: Config, mode: CrawlMode) -> anyhow::Result<()> {
    if config.domains.is_empty() {
        println!(
            "{} No domains configured. Pass --domains or set them in lots.toml.",
            style("✗").red()
        );
        return Ok(());
    }

    let factory: Arc<dyn SessionFactory> =
        Arc::new(ChromeSessionFactory::new(config.browser.clone()));
    let pool = Arc::new(ProxyPool::new(config.proxies.clone()));

    println!(
        "{} Crawling {} domain{} with {} prox{}",
        style("→").cyan(),
        config.domains.len(),
        if config.domains.len() == 1 { "" } else { "s" },
        pool.len(),
        if pool.len() == 1 { "y" } else { "ies" },
    );

    let outcomes = match mode {
        CrawlMode::Sequential => crawl_sequential(factory, pool, &config).await,
        CrawlMode::Parallel => crawl_parallel(factory, pool, &config).await,
    };

    print_summary(&outcomes);
    Ok(())
}

struct DomainOutcome {
    domain: String,
    records: usize,
    metrics: RunMetrics,
    export: Option<ExportPaths>,
    export_error: Option<String>,
}

async fn run_domain(
    factory: Arc<dyn SessionFactory>,
    pool: Arc<ProxyPool>,
    domain: String,
    config: Config,
) -> DomainOutcome {
    let (records, metrics) = crawler::crawl_domain(factory, pool, &domain, &config).await;

    let (export, export_error) = match export::export_domain(&records, &metrics, &config.output) {
        Ok(paths) => (Some(paths), None),
        Err(e) => (None, Some(e.to_string())),
    };

    DomainOutcome {
        domain,
        records: records.len(),
        metrics,
        export,
        export_error,
    }
}

async fn crawl_sequential(
    factory: Arc<dyn SessionFactory>,
    pool: Arc<ProxyPool>,
    config: &Config,
) -> Vec<DomainOutcome> {
    let mut outcomes = Vec::new();

    for (i, domain) in config.domains.iter().enumerate() {
        if i > 0 {
            // half-to-full band between domains
            pacing::jitter(
                config.crawl.domain_delay_secs * 0.5,
                config.crawl.domain_delay_secs,
            )
            .await;
        }

        // The scheduler draws its own listing progress bar, so this stays
        // a plain line instead of a second live widget.
        println!("{} Crawling {}...", style("→").cyan(), domain);

        let outcome = run_domain(
            Arc::clone(&factory),
            Arc::clone(&pool),
            domain.clone(),
            config.clone(),
        )
        .await;

        report_domain(&outcome);
        outcomes.push(outcome);
    }

    outcomes
}

async fn crawl_parallel(
    factory: Arc<dyn SessionFactory>,
    pool: Arc<ProxyPool>,
    config: &Config,
) -> Vec<DomainOutcome> {
    let semaphore = Arc::new(Semaphore::new(config.crawl.max_parallel.max(1)));
    let mut handles = Vec::new();

    for domain in &config.domains {
        let factory = Arc::clone(&factory);
        let pool = Arc::clone(&pool);
        let semaphore = Arc::clone(&semaphore);
        let domain = domain.clone();
        let config = config.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.unwrap();
            run_domain(factory, pool, domain, config).await
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(outcome) => {
                report_domain(&outcome);
                outcomes.push(outcome);
            }
            Err(e) => tracing::warn!("Domain task aborted: {}", e),
        }
    }

    outcomes
}

fn report_domain(outcome: &DomainOutcome) {
    if outcome.metrics.captcha_blocked && outcome.records == 0 {
        println!(
            "  {} {}: blocked by {} before any listings were extracted",
            style("✗").red(),
            outcome.domain,
            outcome.metrics.captcha_type,
        );
    } else if outcome.metrics.captcha_blocked {
        println!(
            "  {} {}: {} record(s), blocked by {} at listing {}",
            style("!").yellow(),
            outcome.domain,
            outcome.records,
            outcome.metrics.captcha_type,
            outcome.metrics.blocked_at_listing,
        );
    } else {
        println!(
            "  {} {}: {} record(s)",
            style("✓").green(),
            outcome.domain,
            outcome.records,
        );
    }

    if let Some(paths) = &outcome.export {
        for path in [&paths.json, &paths.csv, &paths.metrics]
            .into_iter()
            .flatten()
        {
            println!("      {}", path.display());
        }
    }
    if let Some(err) = &outcome.export_error {
        println!("  {} export failed: {}", style("!").yellow(), err);
    }
}

fn print_summary(outcomes: &[DomainOutcome]) {
    let total: usize = outcomes.iter().map(|o| o.records).sum();
    let blocked = outcomes
        .iter()
        .filter(|o| o.metrics.captcha_blocked)
        .count();

    println!();
    println!("{}", style("Crawl summary").bold());
    for o in outcomes {
        println!(
            "  {:<32} {:>4} record(s)  {:>5.1}% success  {} error(s)",
            o.domain,
            o.records,
            o.metrics.success_rate * 100.0,
            o.metrics.errors.len(),
        );
    }
    println!(
        "\n{} {} record(s) across {} domain(s){}",
        style("✓").green(),
        total,
        outcomes.len(),
        if blocked > 0 {
            format!(", {} blocked", blocked)
        } else {
            String::new()
        }
    );
}

/// Probe each domain homepage and report whether it is reachable.
///
/// Exits non-zero when any domain is blocked or unreachable, so the
/// command is usable as a preflight in scripts.
async fn cmd_check(config: Config) -> anyhow::Result<()> {
    if config.domains.is_empty() {
        println!(
            "{} No domains configured. Pass them as arguments or set them in lots.toml.",
            style("✗").red()
        );
        return Ok(());
    }

    let factory = ChromeSessionFactory::new(config.browser.clone());
    let pool = ProxyPool::new(config.proxies.clone());
    let mut failures = 0usize;

    for domain in &config.domains {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap(),
        );
        pb.set_message(format!("Checking {}...", domain));

        let result = crawler::check_domain(&factory, &pool, domain, &config).await;
        pb.finish_and_clear();

        match result {
            Ok(PageOutcome::Usable { html, title }) => {
                let label = if title.is_empty() {
                    "untitled".to_string()
                } else {
                    title
                };
                println!(
                    "  {} {}: reachable, {} chars ({})",
                    style("✓").green(),
                    domain,
                    html.len(),
                    label,
                );
            }
            Ok(PageOutcome::Blocked(verdict)) => {
                failures += 1;
                println!(
                    "  {} {}: blocked by {} (confidence {:.2})",
                    style("✗").red(),
                    domain,
                    verdict.kind,
                    verdict.confidence,
                );
            }
            Ok(PageOutcome::Empty { length }) => {
                println!(
                    "  {} {}: page rendered only {} chars",
                    style("!").yellow(),
                    domain,
                    length,
                );
            }
            Err(e) => {
                failures += 1;
                println!("  {} {}: {}", style("✗").red(), domain, e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!(
            "{} of {} domain(s) failed the check",
            failures,
            config.domains.len()
        );
    }
    Ok(())
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    println!("{}", style("Effective configuration").bold());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
