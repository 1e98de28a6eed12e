//! Inventory discovery: template sniffing, pagination parsing, and
//! detail-URL harvesting.
//!
//! Dealer platforms fall into a small closed set of site templates; the
//! detected template decides which pagination parameter and detail-path
//! convention the rest of the run uses.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::PageDriver;
use crate::models::TemplateType;
use crate::navigate::{self, LoadPolicy, PageOutcome};
use crate::pacing;

/// Navigation labels that lead to an inventory page.
const INVENTORY_KEYWORDS: &[&str] = &[
    "inventory",
    "vehicles",
    "new vehicles",
    "used vehicles",
    "cars",
    "trucks",
    "search inventory",
    "view inventory",
    "new cars",
    "used cars",
    "pre-owned",
    "certified",
];

/// Href shapes that identify inventory navigation without reading text.
const INVENTORY_LINK_SELECTORS: &[&str] = &[
    "a[href*='cars-for-sale']",
    "a[href*='inventory']",
    "a[href*='Inventory']",
    "a[href*='vehicles']",
];

static SHOWING_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)showing\s+([\d,]+)\s*[-\x{2013}]\s*([\d,]+)\s+of\s+([\d,]+)").unwrap()
});

static PAGE_OF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)page\s+(\d+)\s+of\s+(\d+)").unwrap());

/// Pagination state parsed from an inventory page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub current_page: usize,
    pub total_pages: usize,
}

impl Pagination {
    pub fn single_page() -> Self {
        Self {
            current_page: 1,
            total_pages: 1,
        }
    }
}

/// Sniff the site template from homepage or inventory HTML.
///
/// Each platform family leaves distinctive markers in its navigation;
/// an unrecognized site falls back to the primary template.
pub fn detect_template(html: &str) -> TemplateType {
    const TEMPLATE1_MARKERS: &[&str] = &[
        "/Inventory/Details",
        "VehicleSearchResults",
        "Search Inventory",
    ];
    const TEMPLATE2_MARKERS: &[&str] = &["/details/", "View All Inventory"];

    if TEMPLATE1_MARKERS.iter().any(|m| html.contains(m)) {
        return TemplateType::Template1;
    }
    if TEMPLATE2_MARKERS.iter().any(|m| html.contains(m)) {
        return TemplateType::Template2;
    }
    TemplateType::default()
}

/// Parse pagination metadata, trying the richer "Showing A - B of N"
/// form first, then "Page A of N", then numbered pagination links.
pub fn parse_pagination(html: &str, template: TemplateType) -> Pagination {
    if let Some(caps) = SHOWING_RANGE_RE.captures(html) {
        let first = parse_number(&caps[1]);
        let last = parse_number(&caps[2]);
        let total = parse_number(&caps[3]);
        if let (Some(first), Some(last), Some(total)) = (first, last, total) {
            if first >= 1 && last >= first && total >= 1 {
                let page_size = last - first + 1;
                let total_pages = total.div_ceil(page_size);
                let current_page = (first - 1) / page_size + 1;
                return Pagination {
                    current_page,
                    total_pages,
                };
            }
        }
    }

    if let Some(caps) = PAGE_OF_RE.captures(html) {
        let current = caps[1].parse::<usize>().ok();
        let total = caps[2].parse::<usize>().ok();
        if let (Some(current), Some(total)) = (current, total) {
            if current >= 1 && total >= current {
                return Pagination {
                    current_page: current,
                    total_pages: total,
                };
            }
        }
    }

    if let Some(pagination) = scan_pagination_links(html, template) {
        return pagination;
    }

    Pagination::single_page()
}

fn scan_pagination_links(html: &str, template: TemplateType) -> Option<Pagination> {
    let selectors: &[&str] = match template {
        TemplateType::Template1 => &[".pagination a", "ul.pagination li a", "a.page-link"],
        TemplateType::Template2 => &[".paging a", ".pager a", ".pagination a"],
    };

    let doc = Html::parse_document(html);
    for sel in selectors {
        if let Ok(selector) = Selector::parse(sel) {
            let mut max_page = 0usize;
            for element in doc.select(&selector) {
                let text: String = element.text().collect();
                if let Ok(n) = text.trim().parse::<usize>() {
                    max_page = max_page.max(n);
                }
            }
            if max_page >= 1 {
                return Some(Pagination {
                    current_page: 1,
                    total_pages: max_page,
                });
            }
        }
    }
    None
}

fn parse_number(raw: &str) -> Option<usize> {
    raw.replace(',', "").parse().ok()
}

/// Extract detail-page URLs matching the template's path convention,
/// resolved against `base` and deduplicated in first-seen order.
pub fn extract_detail_links(html: &str, base: &Url, template: TemplateType) -> Vec<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse("a[href]").unwrap();
    let needle = template.detail_path().to_lowercase();

    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for element in doc.select(&selector) {
        let href = match element.value().attr("href") {
            Some(h) => h,
            None => continue,
        };
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            continue;
        }
        if !href.to_lowercase().contains(&needle) {
            continue;
        }
        let resolved = match base.join(href) {
            Ok(u) => u.to_string(),
            Err(_) => continue,
        };
        if seen.insert(resolved.clone()) {
            urls.push(resolved);
        }
    }

    urls
}

/// Build the URL for `page` of an inventory listing, replacing any
/// existing pagination parameter with the template's convention.
pub fn page_url(inventory: &Url, template: TemplateType, page: usize) -> Url {
    let param = template.page_param();
    let kept: Vec<(String, String)> = inventory
        .query_pairs()
        .filter(|(k, _)| k.as_ref() != param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut url = inventory.clone();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        pairs.append_pair(param, &page.to_string());
    }
    url
}

/// Click through to the inventory page from a homepage.
///
/// Tries href-shaped selectors first, then falls back to matching link
/// text against the navigation keyword list. Returns false when the
/// homepage itself appears to be the inventory page.
pub async fn enter_inventory(driver: &dyn PageDriver) -> bool {
    for selector in INVENTORY_LINK_SELECTORS {
        match driver.select_all(selector).await {
            Ok(elements) if !elements.is_empty() => {
                debug!(
                    "Found {} inventory link(s) via {}",
                    elements.len(),
                    selector
                );
                if elements[0].click().await.is_ok() {
                    return true;
                }
            }
            Ok(_) => {}
            Err(e) => debug!("Selector {} failed: {}", selector, e),
        }
    }

    match driver.select_all("a").await {
        Ok(elements) => {
            for element in elements {
                let text = element.text().await.unwrap_or_default();
                let text = text.trim().to_lowercase();
                if INVENTORY_KEYWORDS.iter().any(|k| text == *k) && element.click().await.is_ok() {
                    return true;
                }
            }
        }
        Err(e) => debug!("Link scan failed: {}", e),
    }

    false
}

/// Walk inventory pages and harvest detail URLs across them.
///
/// The first page's HTML is reused rather than reloaded. A page that
/// fails to load, comes back blocked, or is empty contributes zero URLs
/// and the walk continues; one bad page cannot zero out a run.
pub async fn harvest_detail_urls(
    driver: &dyn PageDriver,
    inventory_url: &Url,
    first_page_html: &str,
    template: TemplateType,
    policy: &LoadPolicy,
    max_pages: usize,
    wait_band: (f64, f64),
) -> (Vec<String>, Pagination) {
    let pagination = parse_pagination(first_page_html, template);
    let walk_limit = pagination.total_pages.min(max_pages.max(1));

    info!(
        "Inventory spans {} page(s); walking up to {}",
        pagination.total_pages, walk_limit
    );

    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    absorb(
        &mut seen,
        &mut urls,
        extract_detail_links(first_page_html, inventory_url, template),
    );

    for page in 2..=walk_limit {
        // deliberately slow so the walk does not read as a burst
        pacing::jitter(wait_band.0, wait_band.1).await;

        let target = page_url(inventory_url, template, page);
        match navigate::load_page(driver, target.as_str(), policy).await {
            Ok(PageOutcome::Usable { html, .. }) => {
                let found = extract_detail_links(&html, &target, template);
                debug!("Page {}: {} detail link(s)", page, found.len());
                absorb(&mut seen, &mut urls, found);
            }
            Ok(PageOutcome::Blocked(verdict)) => {
                warn!("Page {} blocked ({}); skipping", page, verdict.kind);
            }
            Ok(PageOutcome::Empty { length }) => {
                warn!("Page {} empty ({} bytes); skipping", page, length);
            }
            Err(e) => {
                warn!("Page {} failed: {}; skipping", page, e);
            }
        }
    }

    (urls, pagination)
}

fn absorb(seen: &mut HashSet<String>, urls: &mut Vec<String>, found: Vec<String>) {
    for url in found {
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::ElementDriver;
    use crate::error::{CrawlError, Result};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    fn base() -> Url {
        Url::parse("https://dealer.example.com/inventory").unwrap()
    }

    fn fast_policy() -> LoadPolicy {
        LoadPolicy {
            wait_min_secs: 0.0,
            wait_max_secs: 0.0,
            reading_min_secs: 0.0,
            reading_max_secs: 0.0,
            ready_timeout_secs: 2,
            min_content_length: 100,
        }
    }

    fn inventory_page(links: &[&str], pagination_text: &str) -> String {
        let mut html = String::from("<html><head><title>Inventory</title></head><body>");
        html.push_str(&format!("<div class=\"results\">{}</div>", pagination_text));
        for link in links {
            html.push_str(&format!(
                "<li class=\"vehicle-card\"><a href=\"{}\">View</a></li>",
                link
            ));
        }
        while html.len() < 400 {
            html.push_str("<p>Quality pre-owned trucks and sedans at fair prices.</p>");
        }
        html.push_str("</body></html>");
        html
    }

    #[test]
    fn test_detect_template1_markers() {
        let html = "<nav><a href=\"/Inventory/Details/Used-2021\">listing</a></nav>";
        assert_eq!(detect_template(html), TemplateType::Template1);
    }

    #[test]
    fn test_detect_template2_markers() {
        let html = "<nav><a href=\"/details/used-2021\">listing</a><span>View All Inventory</span></nav>";
        assert_eq!(detect_template(html), TemplateType::Template2);
    }

    #[test]
    fn test_detect_template_defaults_to_primary() {
        assert_eq!(
            detect_template("<html><body>hello</body></html>"),
            TemplateType::Template1
        );
    }

    #[test]
    fn test_parse_pagination_showing_range() {
        let html = "<div>Showing 1 - 24 of 245 Vehicles</div>";
        let p = parse_pagination(html, TemplateType::Template1);
        assert_eq!(p.current_page, 1);
        assert_eq!(p.total_pages, 11);
    }

    #[test]
    fn test_parse_pagination_showing_range_with_commas() {
        let html = "<div>Showing 25 - 48 of 1,024 Vehicles</div>";
        let p = parse_pagination(html, TemplateType::Template1);
        assert_eq!(p.current_page, 2);
        assert_eq!(p.total_pages, 43);
    }

    #[test]
    fn test_parse_pagination_page_of() {
        let html = "<span class=\"paging\">Page 3 of 7</span>";
        let p = parse_pagination(html, TemplateType::Template2);
        assert_eq!(p.current_page, 3);
        assert_eq!(p.total_pages, 7);
    }

    #[test]
    fn test_parse_pagination_link_scan_fallback() {
        let html = r#"
            <ul class="pagination">
                <li><a href="?page=1">1</a></li>
                <li><a href="?page=2">2</a></li>
                <li><a href="?page=5">5</a></li>
                <li><a href="?page=2">Next</a></li>
            </ul>
        "#;
        let p = parse_pagination(html, TemplateType::Template1);
        assert_eq!(p.current_page, 1);
        assert_eq!(p.total_pages, 5);
    }

    #[test]
    fn test_parse_pagination_single_page_fallback() {
        let p = parse_pagination("<html><body>no listings</body></html>", TemplateType::Template1);
        assert_eq!(p, Pagination::single_page());
    }

    #[test]
    fn test_extract_detail_links_dedupes_in_order() {
        let html = r##"
            <a href="/Inventory/Details/Used-2021-Toyota-Camry/123">A</a>
            <a href="https://dealer.example.com/Inventory/Details/Used-2020-Honda-Civic/456">B</a>
            <a href="/Inventory/Details/Used-2021-Toyota-Camry/123">dup</a>
            <a href="/inventory">nav link</a>
            <a href="javascript:void(0)">js</a>
            <a href="#top">anchor</a>
        "##;
        let urls = extract_detail_links(html, &base(), TemplateType::Template1);
        assert_eq!(
            urls,
            vec![
                "https://dealer.example.com/Inventory/Details/Used-2021-Toyota-Camry/123",
                "https://dealer.example.com/Inventory/Details/Used-2020-Honda-Civic/456",
            ]
        );
    }

    #[test]
    fn test_extract_detail_links_template2_path() {
        let html = r#"<a href="/details/used-2019-ford-f150">A</a><a href="/about">B</a>"#;
        let urls = extract_detail_links(html, &base(), TemplateType::Template2);
        assert_eq!(
            urls,
            vec!["https://dealer.example.com/details/used-2019-ford-f150"]
        );
    }

    #[test]
    fn test_page_url_replaces_pagination_param() {
        let inventory = Url::parse("https://dealer.example.com/inventory?sort=price&page=1").unwrap();
        let url = page_url(&inventory, TemplateType::Template1, 3);
        assert_eq!(
            url.as_str(),
            "https://dealer.example.com/inventory?sort=price&page=3"
        );

        let url = page_url(&base(), TemplateType::Template2, 4);
        assert_eq!(url.as_str(), "https://dealer.example.com/inventory?p=4");
    }

    struct MockElement {
        text: String,
        clicked: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ElementDriver for MockElement {
        async fn click(&self) -> Result<()> {
            self.clicked.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn text(&self) -> Result<String> {
            Ok(self.text.clone())
        }

        async fn attribute(&self, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct MockNav {
        pages: HashMap<String, String>,
        current: Mutex<String>,
        fail_urls: Vec<String>,
        link_selector_hits: HashMap<String, (String, Arc<AtomicBool>)>,
    }

    impl MockNav {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
                current: Mutex::new(String::new()),
                fail_urls: Vec::new(),
                link_selector_hits: HashMap::new(),
            }
        }
    }

    #[async_trait]
    impl PageDriver for MockNav {
        async fn navigate(&self, url: &str) -> Result<()> {
            if self.fail_urls.iter().any(|u| u == url) {
                return Err(CrawlError::Navigation {
                    url: url.to_string(),
                    reason: "refused".to_string(),
                });
            }
            *self.current.lock().unwrap() = url.to_string();
            Ok(())
        }

        async fn content(&self) -> Result<String> {
            let current = self.current.lock().unwrap().clone();
            Ok(self.pages.get(&current).cloned().unwrap_or_default())
        }

        async fn evaluate(&self, script: &str) -> Result<Value> {
            if script.contains("readyState") {
                return Ok(Value::String("complete".to_string()));
            }
            Ok(Value::Null)
        }

        async fn select_all(&self, selector: &str) -> Result<Vec<Box<dyn ElementDriver>>> {
            if let Some((text, clicked)) = self.link_selector_hits.get(selector) {
                return Ok(vec![Box::new(MockElement {
                    text: text.clone(),
                    clicked: clicked.clone(),
                }) as Box<dyn ElementDriver>]);
            }
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_enter_inventory_clicks_href_match() {
        let clicked = Arc::new(AtomicBool::new(false));
        let mut driver = MockNav::new();
        driver.link_selector_hits.insert(
            "a[href*='inventory']".to_string(),
            ("Inventory".to_string(), clicked.clone()),
        );

        assert!(enter_inventory(&driver).await);
        assert!(clicked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_enter_inventory_falls_back_to_keyword_text() {
        let clicked = Arc::new(AtomicBool::new(false));
        let mut driver = MockNav::new();
        driver
            .link_selector_hits
            .insert("a".to_string(), ("View Inventory".to_string(), clicked.clone()));

        assert!(enter_inventory(&driver).await);
        assert!(clicked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_enter_inventory_reports_no_match() {
        let driver = MockNav::new();
        assert!(!enter_inventory(&driver).await);
    }

    #[tokio::test]
    async fn test_harvest_walks_pages_and_dedupes() {
        let first = inventory_page(
            &[
                "/Inventory/Details/Used-2021-Toyota-Camry/1",
                "/Inventory/Details/Used-2020-Honda-Civic/2",
            ],
            "Showing 1 - 2 of 4",
        );
        let page2_url = "https://dealer.example.com/inventory?page=2";
        let page2 = inventory_page(
            &[
                "/Inventory/Details/Used-2020-Honda-Civic/2",
                "/Inventory/Details/Used-2019-Ford-F150/3",
            ],
            "Showing 3 - 4 of 4",
        );

        let mut driver = MockNav::new();
        driver.pages.insert(page2_url.to_string(), page2);

        let (urls, pagination) = harvest_detail_urls(
            &driver,
            &base(),
            &first,
            TemplateType::Template1,
            &fast_policy(),
            20,
            (0.0, 0.0),
        )
        .await;

        assert_eq!(pagination.total_pages, 2);
        assert_eq!(
            urls,
            vec![
                "https://dealer.example.com/Inventory/Details/Used-2021-Toyota-Camry/1",
                "https://dealer.example.com/Inventory/Details/Used-2020-Honda-Civic/2",
                "https://dealer.example.com/Inventory/Details/Used-2019-Ford-F150/3",
            ]
        );
    }

    #[tokio::test]
    async fn test_harvest_skips_failed_pages() {
        let first = inventory_page(
            &["/Inventory/Details/Used-2021-Toyota-Camry/1"],
            "Showing 1 - 1 of 3",
        );
        let page3 = inventory_page(
            &["/Inventory/Details/Used-2019-Ford-F150/3"],
            "Showing 3 - 3 of 3",
        );

        let mut driver = MockNav::new();
        driver
            .fail_urls
            .push("https://dealer.example.com/inventory?page=2".to_string());
        driver.pages.insert(
            "https://dealer.example.com/inventory?page=3".to_string(),
            page3,
        );

        let (urls, _) = harvest_detail_urls(
            &driver,
            &base(),
            &first,
            TemplateType::Template1,
            &fast_policy(),
            20,
            (0.0, 0.0),
        )
        .await;

        assert_eq!(
            urls,
            vec![
                "https://dealer.example.com/Inventory/Details/Used-2021-Toyota-Camry/1",
                "https://dealer.example.com/Inventory/Details/Used-2019-Ford-F150/3",
            ]
        );
    }

    #[tokio::test]
    async fn test_harvest_respects_max_pages() {
        let first = inventory_page(
            &["/Inventory/Details/Used-2021-Toyota-Camry/1"],
            "Showing 1 - 1 of 100",
        );
        let driver = MockNav::new();

        let (urls, pagination) = harvest_detail_urls(
            &driver,
            &base(),
            &first,
            TemplateType::Template1,
            &fast_policy(),
            1,
            (0.0, 0.0),
        )
        .await;

        assert_eq!(pagination.total_pages, 100);
        assert_eq!(urls.len(), 1);
    }
}
