//! Runs the analyzer over every batch and assembles the ordered report.

use std::time::Instant;

use labrisk_core::{
    AnalysisConfig, AnalysisReport, DiagnosticMetric, LabRiskResult, PatientBatch,
    PatientRiskSummary, ReportOutcome,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::analyzer::RiskAnalyzer;
use crate::catalog::MetricCatalog;
use crate::segment::parse_batches;
use crate::store::{BatchId, BatchStore};

pub const RESPONSE_MESSAGE: &str = "Uploaded and analyzed HL7";

/// Everything a host needs to answer an upload.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRun {
    pub report: AnalysisReport,
    pub batches_parsed: usize,
    pub batch_ids: Vec<BatchId>,
    /// Set when the time budget ran out and some batches were not analyzed.
    pub truncated: bool,
    /// Storing the parsed batches failed; the report was still built from memory.
    pub persistence_error: Option<String>,
}

impl AnalysisRun {
    pub fn outcome(&self) -> ReportOutcome {
        self.report.outcome()
    }

    pub fn response(&self) -> AnalysisResponse<'_> {
        AnalysisResponse {
            message: RESPONSE_MESSAGE,
            patients: &self.report.patients,
            outcome: self.outcome(),
            batches_parsed: self.batches_parsed,
            truncated: self.truncated,
            persistence_error: self.persistence_error.as_deref(),
        }
    }
}

/// Wire shape returned by the hosts.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResponse<'a> {
    pub message: &'static str,
    pub patients: &'a [PatientRiskSummary],
    pub outcome: ReportOutcome,
    pub batches_parsed: usize,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_error: Option<&'a str>,
}

enum BatchOutcome {
    Analyzed(PatientRiskSummary),
    Missing,
    Abandoned,
}

/// Summaries in input order plus whether the time budget cut the run short.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchAnalysis {
    pub summaries: Vec<PatientRiskSummary>,
    pub truncated: bool,
}

impl BatchAnalysis {
    fn from_outcomes(outcomes: Vec<BatchOutcome>) -> Self {
        let mut truncated = false;
        let summaries = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                BatchOutcome::Analyzed(summary) => Some(summary),
                BatchOutcome::Missing => None,
                BatchOutcome::Abandoned => {
                    truncated = true;
                    None
                }
            })
            .collect();
        Self {
            summaries,
            truncated,
        }
    }
}

/// Analyze in-memory batches independently. Output order follows input order.
pub fn analyze_batches(
    batches: &[PatientBatch],
    metrics: &[DiagnosticMetric],
    config: &AnalysisConfig,
) -> BatchAnalysis {
    let analyzer = RiskAnalyzer::new(metrics, config);
    let deadline = Deadline::from_config(config);

    let outcomes = fan_out(batches, |batch| {
        if deadline.expired() {
            BatchOutcome::Abandoned
        } else {
            BatchOutcome::Analyzed(analyzer.analyze(batch))
        }
    });
    BatchAnalysis::from_outcomes(outcomes)
}

/// Re-analyze batches through the store. Ids the store does not know produce no summary.
pub fn analyze_stored(
    ids: &[BatchId],
    store: &dyn BatchStore,
    catalog: &dyn MetricCatalog,
    config: &AnalysisConfig,
) -> LabRiskResult<BatchAnalysis> {
    let metrics = catalog.snapshot()?;
    let analyzer = RiskAnalyzer::new(&metrics, config);
    let deadline = Deadline::from_config(config);

    let outcomes = fan_out(ids, |id| -> LabRiskResult<BatchOutcome> {
        if deadline.expired() {
            return Ok(BatchOutcome::Abandoned);
        }
        Ok(match store.load(id)? {
            Some(batch) => BatchOutcome::Analyzed(analyzer.analyze(&batch)),
            None => {
                warn!(batch_id = %id, "stored batch not found");
                BatchOutcome::Missing
            }
        })
    })
    .into_iter()
    .collect::<LabRiskResult<Vec<_>>>()?;

    Ok(BatchAnalysis::from_outcomes(outcomes))
}

/// Full upload pipeline: catalog snapshot, parse, persist, analyze.
///
/// A catalog failure aborts the run before anything is parsed. A store failure is logged
/// and reported on the returned run, and analysis continues on the in-memory batches.
pub fn analyze_text(
    text: &str,
    catalog: &dyn MetricCatalog,
    store: Option<&dyn BatchStore>,
    config: &AnalysisConfig,
) -> LabRiskResult<AnalysisRun> {
    let metrics = catalog.snapshot()?;
    let batches = parse_batches(text);
    info!(
        batches = batches.len(),
        metrics = metrics.len(),
        "parsed ORU text"
    );

    let (batch_ids, persistence_error) = match store {
        Some(store) => match store.store(&batches) {
            Ok(ids) => (ids, None),
            Err(err) => {
                warn!(error = %err, "failed to persist parsed batches");
                (Vec::new(), Some(err.to_string()))
            }
        },
        None => (Vec::new(), None),
    };

    let analysis = analyze_batches(&batches, &metrics, config);
    let run = AnalysisRun {
        report: AnalysisReport::new(analysis.summaries),
        batches_parsed: batches.len(),
        batch_ids,
        truncated: analysis.truncated,
        persistence_error,
    };

    info!(
        patients = run.report.patients.len(),
        findings = run.report.finding_count(),
        outcome = ?run.outcome(),
        truncated = run.truncated,
        "analysis finished"
    );
    Ok(run)
}

struct Deadline(Option<Instant>);

impl Deadline {
    fn from_config(config: &AnalysisConfig) -> Self {
        Self(config.time_budget().map(|budget| Instant::now() + budget))
    }

    fn expired(&self) -> bool {
        self.0.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[cfg(feature = "parallel")]
fn fan_out<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    use rayon::prelude::*;

    items.par_iter().map(f).collect()
}

#[cfg(not(feature = "parallel"))]
fn fan_out<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    F: Fn(&T) -> R,
{
    items.iter().map(f).collect()
}
