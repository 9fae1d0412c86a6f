//! Cầu nối WASM <-> JavaScript cho việc phân tích bản tin ORU.

use chrono::NaiveDate;
use labrisk_core::{AnalysisConfig, LabRiskError};
use serde::Deserialize;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

/// Cấu hình từ phía JS; khoá nào vắng mặt thì giữ giá trị mặc định.
/// Không hỗ trợ ngân sách thời gian vì `Instant` không dùng được trên wasm32.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsAnalysisConfig {
    #[serde(default)]
    open_max_age: Option<i32>,
    #[serde(default)]
    reference_date: Option<NaiveDate>,
}

impl From<JsAnalysisConfig> for AnalysisConfig {
    fn from(cfg: JsAnalysisConfig) -> Self {
        let mut base = AnalysisConfig::default();
        if let Some(age) = cfg.open_max_age {
            base.open_max_age = age;
        }
        if let Some(date) = cfg.reference_date {
            base.reference_date = Some(date);
        }
        base
    }
}

/// Phân tích văn bản ORU với danh mục chỉ số (mảng bản ghi JSON) và trả về báo cáo.
#[wasm_bindgen]
pub fn analyze_oru(
    oru_text: &str,
    catalog: JsValue,
    config: Option<JsValue>,
) -> Result<JsValue, JsValue> {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let catalog_value = from_value::<serde_json::Value>(catalog)
        .map_err(|err| JsValue::from_str(&format!("Không đọc được danh mục chỉ số: {err}")))?;

    let cfg = match config {
        Some(js_cfg) if !js_cfg.is_undefined() && !js_cfg.is_null() => {
            let cfg: JsAnalysisConfig = from_value(js_cfg)
                .map_err(|err| JsValue::from_str(&format!("Không đọc được config: {err}")))?;
            AnalysisConfig::from(cfg)
        }
        _ => AnalysisConfig::default(),
    };

    let run = labrisk_oru::analyze_oru_value(oru_text, catalog_value, &cfg)
        .map_err(|err| JsValue::from_str(&format_analysis_error(err)))?;

    to_value(&run.response())
        .map_err(|err| JsValue::from_str(&format!("Không serialize báo cáo: {err}")))
}

fn format_analysis_error(err: LabRiskError) -> String {
    format!("Analysis error: {err}")
}
