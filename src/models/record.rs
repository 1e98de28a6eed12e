//! Vehicle record models.
//!
//! A record exists only when a canonical title could be derived from the
//! detail page; everything else is optional. Records are immutable once
//! created and appended to a run-scoped collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Site-layout family for a dealer domain.
///
/// Detected once per run from the homepage and passed to both the URL
/// harvester and the extractor so they agree on URL shape and DOM patterns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateType {
    #[default]
    Template1,
    Template2,
}

impl TemplateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Template1 => "template1",
            Self::Template2 => "template2",
        }
    }

    /// URL path marker identifying detail pages under this template.
    pub fn detail_path(&self) -> &'static str {
        match self {
            Self::Template1 => "/Inventory/Details/",
            Self::Template2 => "/details/",
        }
    }

    /// Query parameter used for inventory pagination.
    pub fn page_param(&self) -> &'static str {
        match self {
            Self::Template1 => "page",
            Self::Template2 => "p",
        }
    }
}

impl std::fmt::Display for TemplateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical per-vehicle fields extracted from a detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleFields {
    pub title: String,
    pub year: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub price: Option<String>,
    pub mileage: Option<String>,
    pub engine: Option<String>,
    pub transmission: Option<String>,
    pub drivetrain: Option<String>,
    pub color: Option<String>,
    pub vin: Option<String>,
    /// Bounded excerpt of the flattened page text, kept for auditing.
    pub raw_text: String,
}

/// One extracted vehicle listing, tagged with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub url: String,
    /// 1-based position of the URL in the harvested list.
    pub listing_number: usize,
    pub extraction_timestamp: DateTime<Utc>,
    pub proxy_used: String,
    pub domain: String,
    pub template_type: TemplateType,
    pub fields: VehicleFields,
}

impl VehicleRecord {
    pub fn new(
        url: String,
        listing_number: usize,
        proxy_used: String,
        domain: String,
        template_type: TemplateType,
        fields: VehicleFields,
    ) -> Self {
        Self {
            url,
            listing_number,
            extraction_timestamp: Utc::now(),
            proxy_used,
            domain,
            template_type,
            fields,
        }
    }
}
