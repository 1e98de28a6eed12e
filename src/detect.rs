//! Captcha and block-page detection.
//!
//! Scores rendered page content against known challenge-family signatures
//! (DataDome, Cloudflare, reCAPTCHA, hCaptcha, plus a generic heuristic).
//! Detection is a pure function of (html, title, url): no network, no state,
//! identical inputs always produce identical verdicts. Anything that looks
//! malformed reports not-blocked and lets the content-length sanity check in
//! the page-load controller make the final call.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Pages shorter than this go through the short-page fast path. Challenge
/// interstitials are almost always well under this size.
const SHORT_PAGE_THRESHOLD: usize = 3000;

/// Very short pages get a confidence bump on the fast path.
const VERY_SHORT_THRESHOLD: usize = 1000;

/// Challenge family recognized by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    None,
    Datadome,
    Cloudflare,
    Recaptcha,
    Hcaptcha,
    GenericBlock,
    Unknown,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Datadome => "datadome",
            Self::Cloudflare => "cloudflare",
            Self::Recaptcha => "recaptcha",
            Self::Hcaptcha => "hcaptcha",
            Self::GenericBlock => "generic_block",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for one page check. Derived on every check, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BlockVerdict {
    pub is_blocked: bool,
    pub kind: BlockKind,
    pub confidence: f64,
}

impl BlockVerdict {
    /// Not-blocked verdict with zero confidence.
    pub fn clear() -> Self {
        Self {
            is_blocked: false,
            kind: BlockKind::None,
            confidence: 0.0,
        }
    }

    fn blocked(kind: BlockKind, confidence: f64) -> Self {
        Self {
            is_blocked: true,
            kind,
            confidence,
        }
    }
}

/// Signature set for one challenge family.
struct FamilySignature {
    kind: BlockKind,
    keywords: &'static [&'static str],
    patterns: Vec<Regex>,
    /// Minimum normalized score before this family reports blocked.
    /// High-specificity markup (hcaptcha) is trustworthy at low scores,
    /// so its threshold is strict; the generic heuristic is lenient.
    threshold: f64,
}

static FAMILY_SIGNATURES: LazyLock<Vec<FamilySignature>> = LazyLock::new(|| {
    vec![
        FamilySignature {
            kind: BlockKind::Datadome,
            keywords: &["datadome", "geo.captcha-delivery.com", "datadome-captcha"],
            patterns: vec![
                Regex::new(r"(?i)datadome[^>]*blocked").unwrap(),
                Regex::new(r"(?i)geo\.captcha-delivery\.com").unwrap(),
                Regex::new(r"(?i)datadome-captcha").unwrap(),
            ],
            threshold: 0.7,
        },
        FamilySignature {
            kind: BlockKind::Cloudflare,
            keywords: &["cloudflare", "cf-chl-bypass", "turnstile", "challenge"],
            patterns: vec![
                Regex::new(r"(?i)cloudflare[^>]*challenge").unwrap(),
                Regex::new(r"(?i)cf-chl-bypass").unwrap(),
                Regex::new(r"(?i)turnstile").unwrap(),
                Regex::new(r"(?i)checking.*browser").unwrap(),
            ],
            threshold: 0.8,
        },
        FamilySignature {
            kind: BlockKind::Recaptcha,
            keywords: &["recaptcha", "google.com/recaptcha", "g-recaptcha"],
            patterns: vec![
                Regex::new(r"(?i)google\.com/recaptcha").unwrap(),
                Regex::new(r"(?i)g-recaptcha").unwrap(),
                Regex::new(r"(?i)recaptcha[^>]*challenge").unwrap(),
            ],
            threshold: 0.9,
        },
        FamilySignature {
            kind: BlockKind::Hcaptcha,
            keywords: &["hcaptcha", "hcaptcha.com", "h-captcha"],
            patterns: vec![
                Regex::new(r"(?i)hcaptcha\.com").unwrap(),
                Regex::new(r"(?i)h-captcha").unwrap(),
                Regex::new(r"(?i)hcaptcha[^>]*challenge").unwrap(),
            ],
            threshold: 0.9,
        },
        FamilySignature {
            kind: BlockKind::GenericBlock,
            keywords: &[
                "access denied",
                "blocked",
                "forbidden",
                "rate limit",
                "cmsg",
                "animation",
                "opacity",
            ],
            patterns: vec![
                Regex::new(r"(?i)access.*denied").unwrap(),
                Regex::new(r"(?i)blocked.*request").unwrap(),
                Regex::new(r"(?i)forbidden").unwrap(),
                Regex::new(r"(?i)rate.*limit").unwrap(),
                Regex::new(r"(?i)#cmsg").unwrap(),
                Regex::new(r"(?i)animation.*opacity").unwrap(),
            ],
            threshold: 0.3,
        },
    ]
});

/// High-signal branded substrings checked first on short pages. A hit here
/// attributes the verdict to the specific family rather than generic_block.
const SHORT_PAGE_FAMILIES: &[(BlockKind, &[&str])] = &[
    (BlockKind::Datadome, &["datadome", "geo.captcha-delivery.com"]),
    (
        BlockKind::Cloudflare,
        &["cloudflare", "cf-chl-bypass", "turnstile"],
    ),
    (BlockKind::Recaptcha, &["recaptcha", "g-recaptcha"]),
    (BlockKind::Hcaptcha, &["hcaptcha", "h-captcha"]),
];

/// Unbranded indicators for the short-page fast path. Includes CSS-obfuscation
/// markers (cmsg, keyframes) that challenge vendors embed in interstitials.
const SHORT_PAGE_INDICATORS: &[&str] = &[
    "cmsg",
    "animation",
    "opacity",
    "keyframes",
    "cfasync",
    "captcha",
    "verify",
    "human",
    "robot",
    "blocked",
    "access denied",
];

/// Classify page content as blocked or usable.
///
/// Short pages take a fast path: branded family signatures win outright,
/// then unbranded block indicators report generic_block. Longer pages go
/// through weighted per-family scoring: a keyword hit contributes 0.3 in
/// the body, 0.2 in the title, 0.1 in the URL; a regex signature 0.4 in
/// the body, 0.2 in the title. The sum is normalized by the number of
/// signature items checked and compared against that family's threshold.
pub fn detect(html: &str, title: &str, url: &str) -> BlockVerdict {
    if html.is_empty() {
        return BlockVerdict::clear();
    }

    let text = html.to_lowercase();
    let title_lower = title.to_lowercase();
    let url_lower = url.to_lowercase();

    if html.len() < SHORT_PAGE_THRESHOLD {
        if let Some(verdict) = detect_short_page(html, &text) {
            return verdict;
        }
    }

    let mut best_kind = BlockKind::None;
    let mut best_score = 0.0;
    let mut best_threshold = f64::MAX;

    for family in FAMILY_SIGNATURES.iter() {
        let mut score = 0.0;
        let mut total_checks = 0u32;

        for keyword in family.keywords {
            total_checks += 1;
            if text.contains(keyword) {
                score += 0.3;
            }
            if title_lower.contains(keyword) {
                score += 0.2;
            }
            if url_lower.contains(keyword) {
                score += 0.1;
            }
        }

        for pattern in &family.patterns {
            total_checks += 1;
            if pattern.is_match(&text) {
                score += 0.4;
            }
            if pattern.is_match(&title_lower) {
                score += 0.2;
            }
        }

        let normalized = if total_checks > 0 {
            (score / f64::from(total_checks)).min(1.0)
        } else {
            0.0
        };

        if normalized > best_score {
            best_kind = family.kind;
            best_score = normalized;
            best_threshold = family.threshold;
        }
    }

    if best_kind != BlockKind::None && best_score >= best_threshold {
        return BlockVerdict::blocked(best_kind, best_score);
    }

    BlockVerdict::clear()
}

/// Fast path for abnormally short pages.
fn detect_short_page(html: &str, text: &str) -> Option<BlockVerdict> {
    for (kind, keywords) in SHORT_PAGE_FAMILIES {
        let hits = keywords.iter().filter(|k| text.contains(*k)).count();
        if hits > 0 {
            let mut confidence = 0.9 + 0.02 * (hits - 1) as f64;
            if html.len() < VERY_SHORT_THRESHOLD {
                confidence += 0.03;
            }
            return Some(BlockVerdict::blocked(*kind, confidence.min(0.95)));
        }
    }

    let hits = SHORT_PAGE_INDICATORS
        .iter()
        .filter(|k| text.contains(*k))
        .count();
    if hits > 0 {
        let mut confidence = 0.8 + 0.02 * hits.min(5) as f64;
        if html.len() < VERY_SHORT_THRESHOLD {
            confidence += 0.05;
        }
        return Some(BlockVerdict::blocked(
            BlockKind::GenericBlock,
            confidence.min(0.95),
        ));
    }

    None
}
