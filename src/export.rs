//! Result persistence: JSON records, a flattened CSV, and run metrics.
//!
//! One export call per domain run. File names carry the domain and a
//! timestamp so repeated runs never clobber each other.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::OutputSettings;
use crate::error::Result;
use crate::models::{RunMetrics, VehicleRecord};

/// Column order of the flattened CSV export.
const CSV_HEADERS: &[&str] = &[
    "listing_number",
    "url",
    "title",
    "year",
    "make",
    "model",
    "price",
    "mileage",
    "engine",
    "transmission",
    "drivetrain",
    "color",
    "vin",
    "extraction_timestamp",
];

/// Paths produced by one domain export.
#[derive(Debug, Default)]
pub struct ExportPaths {
    pub json: Option<PathBuf>,
    pub csv: Option<PathBuf>,
    pub metrics: Option<PathBuf>,
}

/// Top-level shape of the per-domain results file.
#[derive(Serialize)]
struct ResultsDocument<'a> {
    domain: &'a str,
    crawler_type: &'a str,
    exported_at: DateTime<Utc>,
    record_count: usize,
    records: &'a [VehicleRecord],
}

/// Write records and metrics for one domain according to the output settings.
pub fn export_domain(
    records: &[VehicleRecord],
    metrics: &RunMetrics,
    output: &OutputSettings,
) -> Result<ExportPaths> {
    std::fs::create_dir_all(&output.dir)?;

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let slug = file_slug(&metrics.domain);
    let mut paths = ExportPaths::default();

    if output.json {
        let path = output.dir.join(format!("{}_{}.json", slug, stamp));
        write_records_json(records, metrics, &path)?;
        paths.json = Some(path);
    }

    if output.csv {
        let path = output.dir.join(format!("{}_{}.csv", slug, stamp));
        write_records_csv(records, &path)?;
        paths.csv = Some(path);
    }

    if output.metrics {
        let path = output.dir.join(format!("metrics_{}_{}.json", slug, stamp));
        write_metrics_json(metrics, &path)?;
        paths.metrics = Some(path);
    }

    Ok(paths)
}

fn write_records_json(records: &[VehicleRecord], metrics: &RunMetrics, path: &Path) -> Result<()> {
    let document = ResultsDocument {
        domain: &metrics.domain,
        crawler_type: &metrics.crawler_type,
        exported_at: Utc::now(),
        record_count: records.len(),
        records,
    };
    let json = serde_json::to_string_pretty(&document)?;
    std::fs::write(path, json)?;
    info!("Saved {} record(s) to {:?}", records.len(), path);
    Ok(())
}

fn write_records_csv(records: &[VehicleRecord], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(CSV_HEADERS)?;
    for record in records {
        writer.write_record(csv_row(record))?;
    }
    writer.flush()?;
    info!("Saved {} row(s) to {:?}", records.len(), path);
    Ok(())
}

fn write_metrics_json(metrics: &RunMetrics, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(metrics)?;
    std::fs::write(path, json)?;
    info!("Saved run metrics to {:?}", path);
    Ok(())
}

fn csv_row(record: &VehicleRecord) -> Vec<String> {
    fn opt(value: &Option<String>) -> String {
        value.clone().unwrap_or_default()
    }

    let f = &record.fields;
    vec![
        record.listing_number.to_string(),
        record.url.clone(),
        f.title.clone(),
        opt(&f.year),
        opt(&f.make),
        opt(&f.model),
        opt(&f.price),
        opt(&f.mileage),
        opt(&f.engine),
        opt(&f.transmission),
        opt(&f.drivetrain),
        opt(&f.color),
        opt(&f.vin),
        record.extraction_timestamp.to_rfc3339(),
    ]
}

/// Keep domain names filesystem-safe without losing readability.
fn file_slug(domain: &str) -> String {
    domain
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
