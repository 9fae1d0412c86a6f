//! ORU lab-report text to per-patient risk summaries.
//!
//! The pipeline is: [`segment::parse_batches`] rebuilds patient batches from the raw text,
//! [`analyzer::RiskAnalyzer`] flags each batch against a [`catalog::MetricCatalog`] snapshot,
//! and [`orchestrator`] fans the batches out and keeps the report in input order.

pub mod analyzer;
pub mod catalog;
pub mod orchestrator;
pub mod segment;
pub mod store;

use labrisk_core::{AnalysisConfig, LabRiskResult};
use serde_json::Value;

pub use analyzer::{pick_most_specific, RiskAnalyzer, SkipReason};
pub use catalog::{JsonCatalog, MetricCatalog, MetricRecord, StaticCatalog};
pub use orchestrator::{
    analyze_batches, analyze_stored, analyze_text, AnalysisResponse, AnalysisRun, BatchAnalysis,
};
pub use segment::parse_batches;
pub use store::{BatchId, BatchStore, DirectoryBatchStore, MemoryBatchStore};

/// Analyze ORU text against a catalog given as a JSON string.
pub fn analyze_oru_str(
    text: &str,
    catalog_json: &str,
    config: &AnalysisConfig,
) -> LabRiskResult<AnalysisRun> {
    analyze_text(text, &JsonCatalog::from_json(catalog_json), None, config)
}

/// Analyze ORU text against a catalog given as a `serde_json::Value` array.
pub fn analyze_oru_value(
    text: &str,
    catalog: Value,
    config: &AnalysisConfig,
) -> LabRiskResult<AnalysisRun> {
    let metrics = catalog::metrics_from_value(catalog)?;
    analyze_text(text, &StaticCatalog::new(metrics), None, config)
}
