//! Diagnostic metric catalog sources.

use std::path::{Path, PathBuf};

use labrisk_core::{split_normalized, DiagnosticMetric, Gender, LabRiskError, LabRiskResult};
use serde::Deserialize;
use serde_json::Value;

/// Read-only access to the reference table. One snapshot is taken per analysis run.
pub trait MetricCatalog: Send + Sync {
    fn snapshot(&self) -> LabRiskResult<Vec<DiagnosticMetric>>;
}

/// A catalog record as exported by the metric store.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct MetricRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub oru_sonic_codes: Option<String>,
    #[serde(default)]
    pub oru_sonic_units: Option<String>,
    /// Age bounds in years; fractional values are allowed.
    #[serde(default)]
    pub min_age: Option<f64>,
    #[serde(default)]
    pub max_age: Option<f64>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub standard_lower: Option<f64>,
    #[serde(default)]
    pub standard_higher: Option<f64>,
    #[serde(default)]
    pub everlab_lower: Option<f64>,
    #[serde(default)]
    pub everlab_higher: Option<f64>,
}

impl From<MetricRecord> for DiagnosticMetric {
    fn from(record: MetricRecord) -> Self {
        DiagnosticMetric {
            name: record.name,
            codes: split_normalized(record.oru_sonic_codes.as_deref().unwrap_or_default()),
            units: split_normalized(record.oru_sonic_units.as_deref().unwrap_or_default()),
            min_age: record.min_age,
            max_age: record.max_age,
            gender: Gender::normalize(record.gender.as_deref().unwrap_or_default()),
            everlab_lower: record.everlab_lower,
            everlab_higher: record.everlab_higher,
            standard_lower: record.standard_lower,
            standard_higher: record.standard_higher,
        }
    }
}

/// Catalog backed by metrics already in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    metrics: Vec<DiagnosticMetric>,
}

impl StaticCatalog {
    pub fn new(metrics: Vec<DiagnosticMetric>) -> Self {
        Self { metrics }
    }
}

impl From<Vec<DiagnosticMetric>> for StaticCatalog {
    fn from(metrics: Vec<DiagnosticMetric>) -> Self {
        Self::new(metrics)
    }
}

impl MetricCatalog for StaticCatalog {
    fn snapshot(&self) -> LabRiskResult<Vec<DiagnosticMetric>> {
        Ok(self.metrics.clone())
    }
}

#[derive(Debug, Clone)]
enum JsonSource {
    Inline(String),
    File(PathBuf),
}

/// Catalog read from a JSON array of [`MetricRecord`]s, either inline or from a file.
/// The source is read on every snapshot.
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    source: JsonSource,
}

impl JsonCatalog {
    pub fn from_json(json: impl Into<String>) -> Self {
        Self {
            source: JsonSource::Inline(json.into()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self {
            source: JsonSource::File(path.as_ref().to_path_buf()),
        }
    }
}

impl MetricCatalog for JsonCatalog {
    fn snapshot(&self) -> LabRiskResult<Vec<DiagnosticMetric>> {
        match &self.source {
            JsonSource::Inline(json) => metrics_from_str(json),
            JsonSource::File(path) => {
                let json = std::fs::read_to_string(path).map_err(|err| {
                    LabRiskError::CatalogUnavailable(format!("{}: {err}", path.display()))
                })?;
                metrics_from_str(&json)
            }
        }
    }
}

pub fn metrics_from_str(json: &str) -> LabRiskResult<Vec<DiagnosticMetric>> {
    let records: Vec<MetricRecord> = serde_json::from_str(json)
        .map_err(|err| LabRiskError::CatalogUnavailable(err.to_string()))?;
    Ok(records.into_iter().map(DiagnosticMetric::from).collect())
}

pub fn metrics_from_value(value: Value) -> LabRiskResult<Vec<DiagnosticMetric>> {
    let records: Vec<MetricRecord> = serde_json::from_value(value)
        .map_err(|err| LabRiskError::CatalogUnavailable(err.to_string()))?;
    Ok(records.into_iter().map(DiagnosticMetric::from).collect())
}
