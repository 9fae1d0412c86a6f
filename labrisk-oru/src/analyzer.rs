//! Matches observation results against the metric catalog and flags them.

use chrono::NaiveDate;
use labrisk_core::{
    AnalysisConfig, DateOfBirth, DiagnosticMetric, Gender, ObservationResult, PatientBatch,
    PatientName, PatientRiskSummary, RiskFinding, TestCode, UnitCode,
};
use tracing::debug;

/// Why a single result produced no finding. None of these are errors; the result is
/// simply left out of the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("result is not numeric")]
    NonNumeric,
    #[error("test code is empty")]
    MissingCode,
    #[error("unit is empty")]
    MissingUnit,
    #[error("no metric matches code and unit")]
    NoMatchingMetric,
    #[error("no metric applies to the patient's age and gender")]
    NoApplicableRange,
    #[error("selected metric has no usable lower or upper bound")]
    IncompleteRange,
}

/// Per-patient analysis over a fixed catalog snapshot. Holds no mutable state, so one
/// analyzer can be shared across threads.
#[derive(Debug, Clone)]
pub struct RiskAnalyzer<'a> {
    metrics: &'a [DiagnosticMetric],
    open_max_age: i32,
    as_of: NaiveDate,
}

impl<'a> RiskAnalyzer<'a> {
    pub fn new(metrics: &'a [DiagnosticMetric], config: &AnalysisConfig) -> Self {
        Self {
            metrics,
            open_max_age: config.open_max_age,
            as_of: config.as_of(),
        }
    }

    pub fn analyze(&self, batch: &PatientBatch) -> PatientRiskSummary {
        let details = &batch.patient_details;
        let dob = DateOfBirth::new(details.dob.as_str());
        let age = dob.age_on(self.as_of);
        let gender = Gender::normalize(&details.gender);

        if age.is_none() {
            debug!(
                patient_id = %details.patient_id,
                dob = %details.dob,
                "unreadable date of birth, only age-independent metrics apply"
            );
        }

        let high_risk_results = batch
            .results
            .iter()
            .filter_map(|result| match self.evaluate(result, age, gender) {
                Ok(finding) => Some(finding),
                Err(reason) => {
                    debug!(
                        patient_id = %details.patient_id,
                        test = %result.test_name,
                        %reason,
                        "skipping result"
                    );
                    None
                }
            })
            .collect();

        PatientRiskSummary {
            patient_name: PatientName::parse(&details.patient_name).display(),
            patient_id: details.patient_id.clone(),
            dob: dob.formatted(),
            gender,
            high_risk_results,
        }
    }

    pub fn evaluate(
        &self,
        result: &ObservationResult,
        age: Option<i32>,
        gender: Gender,
    ) -> Result<RiskFinding, SkipReason> {
        let value = parse_numeric(&result.result).ok_or(SkipReason::NonNumeric)?;

        let code = TestCode::parse(&result.test_name);
        let key = code.lookup_key().ok_or(SkipReason::MissingCode)?;
        let unit = UnitCode::parse(&result.units)
            .key()
            .ok_or(SkipReason::MissingUnit)?;

        let mut candidates = self.candidates(&key, &unit);
        if candidates.is_empty() {
            if let Some(alias) = code.alias_key() {
                candidates = self.candidates(&alias, &unit);
            }
        }
        if candidates.is_empty() {
            return Err(SkipReason::NoMatchingMetric);
        }

        let metric = pick_most_specific(candidates, age, gender, self.open_max_age)
            .ok_or(SkipReason::NoApplicableRange)?;
        let range = metric.resolve_range().ok_or(SkipReason::IncompleteRange)?;

        Ok(RiskFinding {
            test_name: result.test_name.clone(),
            result: result.result.clone(),
            units: unit,
            reference_range: range.to_string(),
            flag: range.classify(value),
            matched_metric_name: metric.name.clone(),
        })
    }

    fn candidates(&self, code: &str, unit: &str) -> Vec<&'a DiagnosticMetric> {
        self.metrics
            .iter()
            .filter(|metric| metric.matches(code, unit))
            .collect()
    }
}

/// Keeps the metrics that apply to the patient and returns the one with the narrowest age
/// span. Ties go to the earliest candidate.
pub fn pick_most_specific<'m>(
    candidates: impl IntoIterator<Item = &'m DiagnosticMetric>,
    age: Option<i32>,
    gender: Gender,
    open_max_age: i32,
) -> Option<&'m DiagnosticMetric> {
    candidates
        .into_iter()
        .filter(|metric| metric.applies_to(age, gender))
        .min_by(|a, b| a.age_span(open_max_age).total_cmp(&b.age_span(open_max_age)))
}

fn parse_numeric(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use labrisk_core::{Flag, PatientDetails};

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            reference_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            ..AnalysisConfig::default()
        }
    }

    fn glucose() -> DiagnosticMetric {
        DiagnosticMetric::new("Glucose", "glu", "mg/dl")
            .with_age(Some(0.0), Some(200.0))
            .with_standard_range(Some(70.0), Some(110.0))
    }

    fn obx(test_name: &str, result: &str, units: &str) -> ObservationResult {
        ObservationResult {
            test_name: test_name.into(),
            result: result.into(),
            units: units.into(),
            ..ObservationResult::default()
        }
    }

    fn batch(dob: &str, gender: &str, results: Vec<ObservationResult>) -> PatientBatch {
        PatientBatch {
            patient_details: PatientDetails {
                patient_id: "123".into(),
                patient_name: "Doe^Jane".into(),
                dob: dob.into(),
                gender: gender.into(),
            },
            results,
        }
    }

    #[test]
    fn glucose_example_is_normal() {
        let metrics = vec![glucose()];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);

        let summary = analyzer.analyze(&batch(
            "19900615",
            "F",
            vec![obx("GLU^GLUCOSE", "95", "mg/dl^MGDL")],
        ));

        assert_eq!(summary.patient_name, "Jane Doe");
        assert_eq!(summary.patient_id, "123");
        assert_eq!(summary.dob, "1990-06-15");
        assert_eq!(summary.gender, Gender::Female);
        assert_eq!(
            summary.high_risk_results,
            vec![RiskFinding {
                test_name: "GLU^GLUCOSE".into(),
                result: "95".into(),
                units: "mg/dl".into(),
                reference_range: "70 - 110".into(),
                flag: Flag::Normal,
                matched_metric_name: "Glucose".into(),
            }]
        );
    }

    #[test]
    fn non_numeric_results_are_skipped() {
        let metrics = vec![glucose()];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);

        for raw in ["", "   ", "pending", "NaN", "inf", ">5"] {
            assert_eq!(
                analyzer.evaluate(&obx("GLU^GLUCOSE", raw, "mg/dl"), Some(30), Gender::Any),
                Err(SkipReason::NonNumeric),
                "{raw:?}"
            );
        }
    }

    #[test]
    fn empty_code_or_unit_is_skipped() {
        let metrics = vec![glucose()];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);

        assert_eq!(
            analyzer.evaluate(&obx("GLU", "95", "mg/dl"), Some(30), Gender::Any),
            Err(SkipReason::MissingCode)
        );
        assert_eq!(
            analyzer.evaluate(&obx("GLU^::", "95", "mg/dl"), Some(30), Gender::Any),
            Err(SkipReason::MissingCode)
        );
        assert_eq!(
            analyzer.evaluate(&obx("GLU^GLUCOSE", "95", "^MGDL"), Some(30), Gender::Any),
            Err(SkipReason::MissingUnit)
        );
    }

    #[test]
    fn text_component_is_the_primary_key() {
        let metrics = vec![
            DiagnosticMetric::new("By identifier", "glu", "mg/dl")
                .with_standard_range(Some(1.0), Some(2.0)),
            DiagnosticMetric::new("By text", "glucose", "mg/dl")
                .with_standard_range(Some(70.0), Some(110.0)),
        ];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);

        let finding = analyzer
            .evaluate(&obx("GLU^Glucose:", "95", "MG/DL"), Some(30), Gender::Any)
            .expect("matched");
        assert_eq!(finding.matched_metric_name, "By text");
        assert_eq!(finding.units, "mg/dl");
    }

    #[test]
    fn unit_must_match_too() {
        let metrics = vec![glucose()];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);

        assert_eq!(
            analyzer.evaluate(&obx("GLU^GLUCOSE", "5.2", "mmol/l"), Some(30), Gender::Any),
            Err(SkipReason::NoMatchingMetric)
        );
    }

    #[test]
    fn narrowest_age_span_wins() {
        let metrics = vec![
            DiagnosticMetric::new("Broad", "hb", "g/l")
                .with_age(Some(0.0), Some(200.0))
                .with_standard_range(Some(100.0), Some(180.0)),
            DiagnosticMetric::new("Adult", "hb", "g/l")
                .with_age(Some(18.0), Some(40.0))
                .with_standard_range(Some(120.0), Some(160.0)),
        ];
        let picked = pick_most_specific(&metrics, Some(25), Gender::Any, 200).expect("picked");
        assert_eq!(picked.name, "Adult");

        let picked = pick_most_specific(&metrics, Some(50), Gender::Any, 200).expect("picked");
        assert_eq!(picked.name, "Broad");
    }

    #[test]
    fn equal_spans_keep_catalog_order() {
        let metrics = vec![
            DiagnosticMetric::new("First", "hb", "g/l").with_age(Some(10.0), Some(20.0)),
            DiagnosticMetric::new("Second", "hb", "g/l").with_age(Some(15.0), Some(25.0)),
        ];
        let picked = pick_most_specific(&metrics, Some(17), Gender::Any, 200).expect("picked");
        assert_eq!(picked.name, "First");
    }

    #[test]
    fn extreme_open_ceiling_does_not_overflow() {
        let metrics = vec![
            DiagnosticMetric::new("Open", "hb", "g/l").with_age(Some(-5.0), None),
            DiagnosticMetric::new("Adult", "hb", "g/l").with_age(Some(18.0), Some(40.0)),
        ];
        let picked =
            pick_most_specific(&metrics, Some(30), Gender::Any, i32::MAX).expect("picked");
        assert_eq!(picked.name, "Adult");
    }

    #[test]
    fn open_bounds_count_as_widest() {
        let metrics = vec![
            DiagnosticMetric::new("Open", "hb", "g/l"),
            DiagnosticMetric::new("Floor", "hb", "g/l").with_age(Some(18.0), None),
        ];
        let picked = pick_most_specific(&metrics, Some(30), Gender::Any, 200).expect("picked");
        assert_eq!(picked.name, "Floor");
    }

    #[test]
    fn female_metric_never_selected_for_male() {
        let metrics = vec![
            DiagnosticMetric::new("Ferritin (F)", "ferritin", "ug/l")
                .with_gender(Gender::Female)
                .with_age(Some(18.0), Some(40.0))
                .with_standard_range(Some(30.0), Some(200.0)),
            DiagnosticMetric::new("Ferritin", "ferritin", "ug/l")
                .with_standard_range(Some(30.0), Some(500.0)),
        ];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);

        let finding = analyzer
            .evaluate(&obx("FER^FERRITIN", "250", "ug/L"), Some(30), Gender::Male)
            .expect("matched");
        assert_eq!(finding.matched_metric_name, "Ferritin");
        assert_eq!(finding.flag, Flag::Normal);

        let only_female = &metrics[..1];
        let analyzer = RiskAnalyzer::new(only_female, &config);
        assert_eq!(
            analyzer.evaluate(&obx("FER^FERRITIN", "250", "ug/L"), Some(30), Gender::Male),
            Err(SkipReason::NoApplicableRange)
        );
    }

    #[test]
    fn everlab_range_is_used_for_classification() {
        let metrics = vec![DiagnosticMetric::new("WBC", "wbc", "x10^9/l")
            .with_everlab_range(Some(4.0), Some(10.0))
            .with_standard_range(Some(2.0), Some(12.0))];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);

        let finding = analyzer
            .evaluate(&obx("WBC^WBC", "11", "x10^9/L"), Some(30), Gender::Any);
        // The unit's own `^` splits it, so only "x10" remains.
        assert_eq!(finding, Err(SkipReason::NoMatchingMetric));

        let metrics = vec![DiagnosticMetric::new("WBC", "wbc", "x10e9/l")
            .with_everlab_range(Some(4.0), Some(10.0))
            .with_standard_range(Some(2.0), Some(12.0))];
        let analyzer = RiskAnalyzer::new(&metrics, &config);
        let finding = analyzer
            .evaluate(&obx("WBC^WBC", "11", "x10e9/L"), Some(30), Gender::Any)
            .expect("matched");
        assert_eq!(finding.reference_range, "4 - 10");
        assert_eq!(finding.flag, Flag::High);
    }

    #[test]
    fn boundary_values_classify_inclusively() {
        let metrics = vec![DiagnosticMetric::new("WBC", "wbc", "x10e9/l")
            .with_standard_range(Some(4.0), Some(11.0))];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);
        let flag_of = |raw: &str| {
            analyzer
                .evaluate(&obx("WBC^WBC", raw, "x10e9/l"), Some(30), Gender::Any)
                .map(|finding| finding.flag)
        };

        assert_eq!(flag_of("4.0"), Ok(Flag::Normal));
        assert_eq!(flag_of("3.99"), Ok(Flag::Low));
        assert_eq!(flag_of("11.0"), Ok(Flag::Normal));
        assert_eq!(flag_of("11.01"), Ok(Flag::High));
    }

    #[test]
    fn incomplete_range_is_skipped() {
        let metrics = vec![DiagnosticMetric::new("CRP", "crp", "mg/l")
            .with_standard_range(None, Some(5.0))];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);

        assert_eq!(
            analyzer.evaluate(&obx("CRP^CRP", "3", "mg/L"), Some(30), Gender::Any),
            Err(SkipReason::IncompleteRange)
        );
    }

    #[test]
    fn raw_result_text_is_preserved() {
        let metrics = vec![glucose()];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);

        let finding = analyzer
            .evaluate(&obx("GLU^GLUCOSE", " 120.50 ", "mg/dl"), Some(30), Gender::Any)
            .expect("matched");
        assert_eq!(finding.result, " 120.50 ");
        assert_eq!(finding.flag, Flag::High);
    }

    #[test]
    fn age_is_computed_from_reference_date() {
        let metrics = vec![
            DiagnosticMetric::new("Child", "alp", "u/l")
                .with_age(Some(0.0), Some(17.0))
                .with_standard_range(Some(100.0), Some(400.0)),
            DiagnosticMetric::new("Adult", "alp", "u/l")
                .with_age(Some(18.0), Some(120.0))
                .with_standard_range(Some(30.0), Some(110.0)),
        ];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);

        // Turns 18 on 2025-03-02, one day after the reference date.
        let summary = analyzer.analyze(&batch(
            "20070302",
            "M",
            vec![obx("ALP^ALP", "150", "U/L")],
        ));
        assert_eq!(summary.high_risk_results[0].matched_metric_name, "Child");

        let summary = analyzer.analyze(&batch(
            "20070301",
            "M",
            vec![obx("ALP^ALP", "150", "U/L")],
        ));
        assert_eq!(summary.high_risk_results[0].matched_metric_name, "Adult");
        assert_eq!(summary.high_risk_results[0].flag, Flag::High);
    }

    #[test]
    fn unreadable_dob_limits_to_open_metrics() {
        let metrics = vec![
            glucose(),
            DiagnosticMetric::new("Sodium", "na", "mmol/l")
                .with_standard_range(Some(135.0), Some(145.0)),
        ];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);

        let summary = analyzer.analyze(&batch(
            "unknown",
            "",
            vec![
                obx("GLU^GLUCOSE", "95", "mg/dl"),
                obx("NA^NA", "150", "mmol/L"),
            ],
        ));
        assert_eq!(summary.dob, "unkn-ow-n");
        assert_eq!(summary.gender, Gender::Any);
        assert_eq!(summary.high_risk_results.len(), 1);
        assert_eq!(summary.high_risk_results[0].matched_metric_name, "Sodium");
        assert_eq!(summary.high_risk_results[0].flag, Flag::High);
    }

    #[test]
    fn repeated_analysis_is_identical() {
        let metrics = vec![
            glucose(),
            DiagnosticMetric::new("Glucose (adult)", "glu", "mg/dl")
                .with_age(Some(18.0), Some(65.0))
                .with_everlab_range(Some(72.0), Some(99.0)),
        ];
        let config = config();
        let analyzer = RiskAnalyzer::new(&metrics, &config);
        let input = batch(
            "19900615",
            "F",
            vec![
                obx("GLU^GLUCOSE", "105", "mg/dl"),
                obx("GLU^GLUCOSE", "abc", "mg/dl"),
                obx("GLU^GLUCOSE", "60", "mg/dl"),
            ],
        );

        let first = analyzer.analyze(&input);
        let second = analyzer.analyze(&input);
        assert_eq!(first, second);
        assert_eq!(first.high_risk_results.len(), 2);
        assert_eq!(first.high_risk_results[0].flag, Flag::High);
        assert_eq!(first.high_risk_results[0].reference_range, "72 - 99");
        assert_eq!(first.high_risk_results[1].flag, Flag::Low);
    }
}
