//! Template-dispatch vehicle extraction.
//!
//! Each site template gets its own pattern table; every field is tried
//! against an ordered candidate list where later entries are deliberately
//! looser fallbacks. A page that yields no title yields no record at all,
//! so a record's presence always means "has at least a title".

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

use crate::models::{TemplateType, VehicleFields};

/// Upper bound on the raw-text excerpt carried in each record.
const RAW_TEXT_LIMIT: usize = 2000;

/// Spec rows longer than this are containers, not label/value pairs.
const SPEC_ROW_LIMIT: usize = 120;

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".gif", ".svg"];

static TITLE_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})\s+([A-Za-z]+)\s+(.+)").unwrap());

static FOR_SALE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+for\s+sale\b.*$").unwrap());

static PRICE_STRICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\s*(\d{1,3}(?:,\d{3})*(?:\.\d{2})?)").unwrap());

static PRICE_LOOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:,\d{3})*(?:\.\d{2})?)").unwrap());

static MILEAGE_LABELED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([\d,]+)\s*(?:miles|mi\.?)\b").unwrap());

static MILEAGE_LOOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:,\d{3})*)").unwrap());

// VINs never contain I, O, or Q
static VIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-HJ-NPR-Z0-9]{17}\b").unwrap());

/// Ordered pattern tables for one site template.
struct TemplateRules {
    title_selectors: &'static [&'static str],
    price_selectors: &'static [&'static str],
    mileage_selectors: &'static [&'static str],
    vin_selectors: &'static [&'static str],
    spec_selectors: &'static [&'static str],
}

const TEMPLATE1_RULES: TemplateRules = TemplateRules {
    title_selectors: &[
        "h1.vehicle-title",
        ".inventory-title h1",
        "h1[itemprop='name']",
        "h1",
        ".vehicle-title",
        ".inventory-title",
    ],
    price_selectors: &[".price", ".vehicle-price", ".listing-price", "[class*='price']"],
    mileage_selectors: &[".mileage", ".vehicle-mileage", "[class*='mileage']"],
    vin_selectors: &["[class*='vin']", "[id*='vin']"],
    spec_selectors: &[".feature", ".spec", ".detail", "li", "td"],
};

const TEMPLATE2_RULES: TemplateRules = TemplateRules {
    title_selectors: &[
        "h1.listing-title",
        ".vehicle-details h1",
        "h1",
        ".listing-title",
    ],
    price_selectors: &[".internet-price", ".price", "[class*='price']"],
    mileage_selectors: &[".miles", ".mileage", "[class*='mileage']", "[class*='miles']"],
    vin_selectors: &["[class*='vin']", "[id*='vin']"],
    spec_selectors: &[".details-list li", ".specs td", "li", "td"],
};

/// Extract canonical vehicle fields from a detail page.
///
/// Returns `None` when no title can be derived; half-empty records are
/// never produced.
pub fn extract(html: &str, template: TemplateType) -> Option<VehicleFields> {
    let doc = Html::parse_document(html);
    let rules = match template {
        TemplateType::Template1 => &TEMPLATE1_RULES,
        TemplateType::Template2 => &TEMPLATE2_RULES,
    };

    let title = extract_title(&doc, rules)?;
    let text = flatten_text(&doc);

    let mut fields = VehicleFields {
        title: title.clone(),
        raw_text: text.chars().take(RAW_TEXT_LIMIT).collect(),
        ..Default::default()
    };

    if let Some(caps) = TITLE_SPLIT_RE.captures(&title) {
        fields.year = Some(caps[1].to_string());
        fields.make = Some(caps[2].to_string());
        fields.model = Some(caps[3].trim().to_string());
    }

    fields.price = extract_price(&doc, &text, rules);
    fields.mileage = extract_mileage(&doc, rules);
    fields.vin = extract_vin(&doc, &text, rules);

    let specs = extract_specs(&doc, rules);
    fields.engine = specs.engine;
    fields.transmission = specs.transmission;
    fields.drivetrain = specs.drivetrain;
    fields.color = specs.color;

    Some(fields)
}

fn extract_title(doc: &Html, rules: &TemplateRules) -> Option<String> {
    for sel in rules.title_selectors {
        if let Ok(selector) = Selector::parse(sel) {
            if let Some(element) = doc.select(&selector).next() {
                let raw: String = element.text().collect::<Vec<_>>().join(" ");
                let cleaned = clean_title(&raw);
                if !cleaned.is_empty() {
                    return Some(cleaned);
                }
            }
        }
    }

    // document title as the minimal fallback
    let selector = Selector::parse("title").unwrap();
    if let Some(element) = doc.select(&selector).next() {
        let cleaned = clean_title(&element.inner_html());
        if !cleaned.is_empty() {
            return Some(cleaned);
        }
    }

    None
}

/// Strip marketing suffixes like "for sale in ..." and trailing dealer
/// names from a heading, collapsing whitespace along the way.
fn clean_title(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let no_sale = FOR_SALE_RE.replace(&collapsed, "").to_string();
    let no_pipe = no_sale.split(" | ").next().unwrap_or("").trim().to_string();
    match no_pipe.rsplit_once(" - ") {
        Some((head, _)) if !head.trim().is_empty() => head.trim().to_string(),
        _ => no_pipe,
    }
}

fn extract_price(doc: &Html, text: &str, rules: &TemplateRules) -> Option<String> {
    for sel in rules.price_selectors {
        if let Ok(selector) = Selector::parse(sel) {
            if let Some(element) = doc.select(&selector).next() {
                let element_text: String = element.text().collect::<Vec<_>>().join(" ");
                if let Some(caps) = PRICE_STRICT_RE.captures(&element_text) {
                    return Some(caps[1].to_string());
                }
                if let Some(caps) = PRICE_LOOSE_RE.captures(&element_text) {
                    return Some(caps[1].to_string());
                }
            }
        }
    }
    // dollar-anchored only once we are off the dedicated price elements
    PRICE_STRICT_RE
        .captures(text)
        .map(|caps| caps[1].to_string())
}

fn extract_mileage(doc: &Html, rules: &TemplateRules) -> Option<String> {
    for sel in rules.mileage_selectors {
        if let Ok(selector) = Selector::parse(sel) {
            if let Some(element) = doc.select(&selector).next() {
                let element_text: String = element.text().collect::<Vec<_>>().join(" ");
                if let Some(caps) = MILEAGE_LABELED_RE.captures(&element_text) {
                    return Some(caps[1].to_string());
                }
                if let Some(caps) = MILEAGE_LOOSE_RE.captures(&element_text) {
                    return Some(caps[1].to_string());
                }
            }
        }
    }
    None
}

fn extract_vin(doc: &Html, text: &str, rules: &TemplateRules) -> Option<String> {
    for sel in rules.vin_selectors {
        if let Ok(selector) = Selector::parse(sel) {
            for element in doc.select(&selector) {
                let element_text: String = element.text().collect::<Vec<_>>().join(" ");
                if let Some(vin) = scan_vin(&element_text) {
                    return Some(vin);
                }
            }
        }
    }
    scan_vin(text)
}

/// Scan whitespace-delimited tokens for a plausible VIN, skipping tokens
/// that look like CDN asset paths or image filenames.
fn scan_vin(text: &str) -> Option<String> {
    for token in text.split_whitespace() {
        if token_is_asset_path(token) {
            continue;
        }
        if let Some(m) = VIN_RE.find(token) {
            return Some(m.as_str().to_string());
        }
    }
    None
}

fn token_is_asset_path(token: &str) -> bool {
    let lower = token.to_lowercase();
    lower.contains("://")
        || lower.contains('/')
        || IMAGE_EXTENSIONS.iter().any(|ext| lower.contains(ext))
}

#[derive(Default)]
struct SpecFields {
    engine: Option<String>,
    transmission: Option<String>,
    drivetrain: Option<String>,
    color: Option<String>,
}

impl SpecFields {
    fn complete(&self) -> bool {
        self.engine.is_some()
            && self.transmission.is_some()
            && self.drivetrain.is_some()
            && self.color.is_some()
    }
}

fn extract_specs(doc: &Html, rules: &TemplateRules) -> SpecFields {
    let mut specs = SpecFields::default();

    for sel in rules.spec_selectors {
        if let Ok(selector) = Selector::parse(sel) {
            for element in doc.select(&selector) {
                let raw: String = element.text().collect::<Vec<_>>().join(" ");
                let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
                if text.is_empty() || text.len() > SPEC_ROW_LIMIT {
                    continue;
                }
                let lower = text.to_lowercase();
                if specs.engine.is_none() && lower.contains("engine") {
                    specs.engine = Some(label_value(&text));
                } else if specs.transmission.is_none() && lower.contains("transmission") {
                    specs.transmission = Some(label_value(&text));
                } else if specs.drivetrain.is_none()
                    && (lower.contains("drivetrain") || lower.contains("drive type"))
                {
                    specs.drivetrain = Some(label_value(&text));
                } else if specs.color.is_none()
                    && (lower.contains("exterior color") || lower.starts_with("color"))
                {
                    specs.color = Some(label_value(&text));
                }
                if specs.complete() {
                    return specs;
                }
            }
        }
    }

    specs
}

/// Take the value half of a "Label: value" row, or the whole row when
/// there is no label.
fn label_value(text: &str) -> String {
    match text.split_once(':') {
        Some((_, value)) if !value.trim().is_empty() => value.trim().to_string(),
        _ => text.trim().to_string(),
    }
}

fn flatten_text(doc: &Html) -> String {
    let joined: String = doc
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ");
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}
