//! Data models for lotscrape.

mod metrics;
mod record;

pub use metrics::RunMetrics;
pub use record::{TemplateType, VehicleFields, VehicleRecord};
