//! Mô hình dữ liệu lõi cho việc phân loại kết quả xét nghiệm từ bản tin ORU.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Tuổi trần mặc định khi metric không khai báo `max_age`.
pub const DEFAULT_OPEN_MAX_AGE: i32 = 200;

/// Cấu hình cho một lượt phân tích.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    /// Tuổi trần dùng để tính độ rộng khoảng tuổi khi metric bỏ trống `max_age`.
    pub open_max_age: i32,
    /// Ngày tham chiếu để tính tuổi; `None` nghĩa là hôm nay (UTC).
    #[serde(default)]
    pub reference_date: Option<NaiveDate>,
    /// Ngân sách thời gian (mili giây) cho cả lượt phân tích. Hết ngân sách thì các
    /// batch còn lại bị bỏ qua và báo cáo được đánh dấu là chưa đầy đủ.
    #[serde(default)]
    pub time_budget_ms: Option<u64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            open_max_age: DEFAULT_OPEN_MAX_AGE,
            reference_date: None,
            time_budget_ms: None,
        }
    }
}

impl AnalysisConfig {
    /// Ngày dùng để tính tuổi bệnh nhân.
    pub fn as_of(&self) -> NaiveDate {
        self.reference_date
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_ms.map(Duration::from_millis)
    }
}

/// Giới tính đã chuẩn hoá.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Gender {
    Male,
    Female,
    #[default]
    Any,
}

impl Gender {
    /// Chuẩn hoá theo chữ cái đầu: `M`/`m` là nam, `F`/`f` là nữ, còn lại là `Any`.
    pub fn normalize(raw: &str) -> Self {
        match raw.chars().next() {
            Some('M' | 'm') => Gender::Male,
            Some('F' | 'f') => Gender::Female,
            _ => Gender::Any,
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Gender::Male => "Male",
            Gender::Female => "Female",
            Gender::Any => "Any",
        };
        f.write_str(label)
    }
}

/// Nhãn phân loại kết quả so với khoảng tham chiếu.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Flag {
    Low,
    Normal,
    High,
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Flag::Low => "LOW",
            Flag::Normal => "NORMAL",
            Flag::High => "HIGH",
        };
        f.write_str(label)
    }
}

/// Thông tin hành chính lấy từ segment `PID`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatientDetails {
    pub patient_id: String,
    /// Dạng thô `last^first`.
    pub patient_name: String,
    /// Dạng thô `YYYYMMDD`.
    pub dob: String,
    pub gender: String,
}

/// Một kết quả xét nghiệm lấy từ segment `OBX`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObservationResult {
    pub test_name: String,
    pub result: String,
    pub units: String,
    pub reference_range: String,
    pub flag: String,
}

/// Một bệnh nhân cùng các kết quả xét nghiệm của họ.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatientBatch {
    pub patient_details: PatientDetails,
    pub results: Vec<ObservationResult>,
}

/// Họ tên tách từ trường ghép `last^first`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientName {
    pub family: String,
    pub given: String,
}

impl PatientName {
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split('^');
        let family = parts.next().unwrap_or_default().to_string();
        let given = parts.next().unwrap_or_default().to_string();
        Self { family, given }
    }

    /// Hiển thị `first last`, đã cắt khoảng trắng hai đầu.
    pub fn display(&self) -> String {
        format!("{} {}", self.given, self.family).trim().to_string()
    }
}

/// Mã xét nghiệm tách từ OBX-3 (`identifier^text`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCode {
    pub identifier: String,
    pub text: String,
}

impl TestCode {
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split('^');
        let identifier = parts.next().unwrap_or_default().to_string();
        let text = parts.next().unwrap_or_default().to_string();
        Self { identifier, text }
    }

    /// Khoá tra cứu chính: thành phần thứ hai đã chuẩn hoá.
    pub fn lookup_key(&self) -> Option<String> {
        non_empty(normalize_code(&self.text))
    }

    /// Khoá phụ: thành phần thứ nhất đã chuẩn hoá, chỉ khi khác khoá chính.
    pub fn alias_key(&self) -> Option<String> {
        let alias = non_empty(normalize_code(&self.identifier))?;
        if self.lookup_key().as_deref() == Some(alias.as_str()) {
            None
        } else {
            Some(alias)
        }
    }
}

/// Đơn vị lấy từ thành phần đầu của OBX-6 (`unit^...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitCode {
    pub unit: String,
}

impl UnitCode {
    pub fn parse(raw: &str) -> Self {
        let unit = raw.split('^').next().unwrap_or_default().to_string();
        Self { unit }
    }

    pub fn key(&self) -> Option<String> {
        non_empty(normalize_token(&self.unit))
    }
}

/// Ngày sinh dạng thô `YYYYMMDD`, không kiểm tra lịch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateOfBirth(String);

impl DateOfBirth {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// `YYYYMMDD` thành `YYYY-MM-DD` bằng cách chèn dấu gạch.
    pub fn formatted(&self) -> String {
        format!(
            "{}-{}-{}",
            slice_chars(&self.0, 0, 4),
            slice_chars(&self.0, 4, 6),
            slice_chars(&self.0, 6, 8)
        )
    }

    /// Số tuổi tròn tính đến `as_of`. Trả về `None` khi ngày sinh không đọc được.
    pub fn age_on(&self, as_of: NaiveDate) -> Option<i32> {
        let year: i32 = ascii_digits(&self.0, 0, 4)?.parse().ok()?;
        let month: u32 = ascii_digits(&self.0, 4, 6)?.parse().ok()?;
        let day: u32 = ascii_digits(&self.0, 6, 8)?.parse().ok()?;

        let mut age = as_of.year() - year;
        if (as_of.month(), as_of.day()) < (month, day) {
            age -= 1;
        }
        Some(age)
    }
}

/// Khoảng tham chiếu đã chọn xong giữa hai tầng everlab và standard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResolvedRange {
    pub lower: f64,
    pub upper: f64,
}

impl ResolvedRange {
    /// Mỗi cận lấy giá trị everlab nếu có, nếu không thì lấy standard.
    /// Thiếu một trong hai cận thì không có khoảng dùng được.
    pub fn resolve(
        everlab_lower: Option<f64>,
        everlab_higher: Option<f64>,
        standard_lower: Option<f64>,
        standard_higher: Option<f64>,
    ) -> Option<Self> {
        let lower = everlab_lower.or(standard_lower)?;
        let upper = everlab_higher.or(standard_higher)?;
        Some(Self { lower, upper })
    }

    /// Hai cận thuộc về `Normal`.
    pub fn classify(&self, value: f64) -> Flag {
        if value < self.lower {
            Flag::Low
        } else if value > self.upper {
            Flag::High
        } else {
            Flag::Normal
        }
    }
}

impl fmt::Display for ResolvedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.lower, self.upper)
    }
}

/// Quy tắc khoảng tham chiếu cho một mã xét nghiệm/đơn vị.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticMetric {
    pub name: String,
    pub codes: BTreeSet<String>,
    pub units: BTreeSet<String>,
    /// Cận tuổi có thể là số lẻ (ví dụ `0.5` tuổi).
    pub min_age: Option<f64>,
    pub max_age: Option<f64>,
    pub gender: Gender,
    pub everlab_lower: Option<f64>,
    pub everlab_higher: Option<f64>,
    pub standard_lower: Option<f64>,
    pub standard_higher: Option<f64>,
}

impl DiagnosticMetric {
    /// Tạo metric từ chuỗi mã và đơn vị nối bằng `;`.
    pub fn new(name: impl Into<String>, codes: &str, units: &str) -> Self {
        Self {
            name: name.into(),
            codes: split_normalized(codes),
            units: split_normalized(units),
            min_age: None,
            max_age: None,
            gender: Gender::Any,
            everlab_lower: None,
            everlab_higher: None,
            standard_lower: None,
            standard_higher: None,
        }
    }

    pub fn with_age(mut self, min_age: Option<f64>, max_age: Option<f64>) -> Self {
        self.min_age = min_age;
        self.max_age = max_age;
        self
    }

    pub fn with_gender(mut self, gender: Gender) -> Self {
        self.gender = gender;
        self
    }

    pub fn with_standard_range(mut self, lower: Option<f64>, higher: Option<f64>) -> Self {
        self.standard_lower = lower;
        self.standard_higher = higher;
        self
    }

    pub fn with_everlab_range(mut self, lower: Option<f64>, higher: Option<f64>) -> Self {
        self.everlab_lower = lower;
        self.everlab_higher = higher;
        self
    }

    /// Khớp khi cả mã và đơn vị (đã chuẩn hoá) đều nằm trong tập của metric.
    pub fn matches(&self, code: &str, unit: &str) -> bool {
        self.codes.contains(code) && self.units.contains(unit)
    }

    /// Kiểm tra tuổi và giới tính. Với tuổi không xác định, chỉ metric không có cận
    /// trên và có cận dưới trống hoặc bằng 0 mới áp dụng.
    pub fn applies_to(&self, age: Option<i32>, gender: Gender) -> bool {
        let age = age.map(f64::from);
        let above_min = match (self.min_age, age) {
            (None, _) => true,
            (Some(min), Some(age)) => age >= min,
            (Some(min), None) => min == 0.0,
        };
        let below_max = match (self.max_age, age) {
            (None, _) => true,
            (Some(max), Some(age)) => age <= max,
            (Some(_), None) => false,
        };
        let gender_ok = self.gender == Gender::Any || self.gender == gender;

        above_min && below_max && gender_ok
    }

    /// Độ rộng khoảng tuổi; tính bằng `f64` nên không tràn với cận tuỳ ý.
    pub fn age_span(&self, open_max_age: i32) -> f64 {
        self.max_age.unwrap_or(f64::from(open_max_age)) - self.min_age.unwrap_or(0.0)
    }

    pub fn resolve_range(&self) -> Option<ResolvedRange> {
        ResolvedRange::resolve(
            self.everlab_lower,
            self.everlab_higher,
            self.standard_lower,
            self.standard_higher,
        )
    }
}

/// Một kết quả đã khớp metric và được gắn nhãn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RiskFinding {
    pub test_name: String,
    pub result: String,
    /// Đơn vị đã chuẩn hoá.
    pub units: String,
    pub reference_range: String,
    pub flag: Flag,
    #[serde(rename = "matchedMetric")]
    pub matched_metric_name: String,
}

/// Tóm tắt cho một bệnh nhân.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatientRiskSummary {
    pub patient_name: String,
    pub patient_id: String,
    pub dob: String,
    pub gender: Gender,
    pub high_risk_results: Vec<RiskFinding>,
}

impl PatientRiskSummary {
    pub fn has_abnormal(&self) -> bool {
        self.high_risk_results
            .iter()
            .any(|finding| finding.flag != Flag::Normal)
    }
}

/// Cách tầng trình bày nên diễn giải một báo cáo.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    /// Không có bệnh nhân, hoặc không kết quả nào khớp được metric.
    NoUsableData,
    /// Có kết quả khớp nhưng tất cả đều bình thường.
    AllNormal,
    /// Có ít nhất một kết quả LOW hoặc HIGH.
    Abnormal,
}

/// Báo cáo cuối cùng, giữ đúng thứ tự batch đầu vào.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AnalysisReport {
    pub patients: Vec<PatientRiskSummary>,
}

impl AnalysisReport {
    pub fn new(patients: Vec<PatientRiskSummary>) -> Self {
        Self { patients }
    }

    pub fn outcome(&self) -> ReportOutcome {
        let has_findings = self
            .patients
            .iter()
            .any(|patient| !patient.high_risk_results.is_empty());

        if !has_findings {
            ReportOutcome::NoUsableData
        } else if self.patients.iter().any(PatientRiskSummary::has_abnormal) {
            ReportOutcome::Abnormal
        } else {
            ReportOutcome::AllNormal
        }
    }

    /// Số kết quả đã khớp metric trên toàn báo cáo.
    pub fn finding_count(&self) -> usize {
        self.patients
            .iter()
            .map(|patient| patient.high_risk_results.len())
            .sum()
    }
}

/// Lỗi chung của quá trình phân tích.
#[derive(Debug, thiserror::Error)]
pub enum LabRiskError {
    #[error("Không lấy được danh mục chỉ số: {0}")]
    CatalogUnavailable(String),
    #[error("Lưu batch thất bại: {0}")]
    Persistence(String),
    #[error("Không đọc được dữ liệu: {0}")]
    Parse(String),
}

pub type LabRiskResult<T> = Result<T, LabRiskError>;

/// Bỏ dấu `:`, cắt khoảng trắng, chuyển chữ thường.
pub fn normalize_code(raw: &str) -> String {
    normalize_token(&raw.replace(':', ""))
}

pub fn normalize_token(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Tách chuỗi nhiều giá trị nối bằng `;` thành tập đã chuẩn hoá.
pub fn split_normalized(raw: &str) -> BTreeSet<String> {
    raw.split(';')
        .map(normalize_token)
        .filter(|value| !value.is_empty())
        .collect()
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn slice_chars(value: &str, start: usize, end: usize) -> String {
    value.chars().skip(start).take(end - start).collect()
}

fn ascii_digits(value: &str, start: usize, end: usize) -> Option<&str> {
    value
        .get(start..end)
        .filter(|part| part.bytes().all(|b| b.is_ascii_digit()))
}
