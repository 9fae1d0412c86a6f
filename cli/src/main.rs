use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use labrisk_core::AnalysisConfig;
use labrisk_oru::{
    analyze_stored, analyze_text, BatchId, BatchStore, DirectoryBatchStore, JsonCatalog,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mức log mặc định khi không đặt `RUST_LOG`.
const DEFAULT_LOG_FILTER: &str = "labrisk=info,labrisk_oru=info";

#[derive(Parser, Debug)]
#[command(
    name = "labrisk",
    about = "Phân loại kết quả xét nghiệm trong bản tin ORU theo khoảng tham chiếu."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// In JSON có thụt lề.
    #[arg(long, global = true)]
    pretty: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse file ORU, lưu các batch (nếu có thư mục) rồi phân tích.
    Analyze {
        /// Đường dẫn tới file ORU dạng text.
        #[arg(short, long)]
        input: PathBuf,
        /// Thư mục lưu batch, mỗi batch một file JSON.
        #[arg(long)]
        store_dir: Option<PathBuf>,
        #[command(flatten)]
        settings: Settings,
    },
    /// Phân tích lại các batch đã lưu theo id.
    Reanalyze {
        /// Thư mục chứa batch đã lưu.
        #[arg(long)]
        store_dir: PathBuf,
        /// Danh sách id batch.
        #[arg(required = true)]
        ids: Vec<String>,
        #[command(flatten)]
        settings: Settings,
    },
}

#[derive(Args, Debug)]
struct Settings {
    /// File JSON danh mục chỉ số.
    #[arg(short, long)]
    catalog: PathBuf,
    /// Ngày tham chiếu để tính tuổi (YYYY-MM-DD), mặc định là hôm nay.
    #[arg(long)]
    as_of: Option<NaiveDate>,
    /// Tuổi trần khi metric bỏ trống max_age.
    #[arg(long)]
    open_max_age: Option<i32>,
    /// Ngân sách thời gian (ms); hết ngân sách thì bỏ các batch còn lại.
    #[arg(long)]
    time_budget_ms: Option<u64>,
}

impl Settings {
    fn config(&self) -> AnalysisConfig {
        let mut config = AnalysisConfig {
            reference_date: self.as_of,
            time_budget_ms: self.time_budget_ms,
            ..AnalysisConfig::default()
        };
        if let Some(age) = self.open_max_age {
            config.open_max_age = age;
        }
        config
    }
}

/// `RUST_LOG` (nếu có) thay hoàn toàn bộ lọc mặc định.
fn log_filter(rust_log: Option<&str>) -> anyhow::Result<EnvFilter> {
    let directives = match rust_log {
        Some(value) if !value.trim().is_empty() => value,
        _ => DEFAULT_LOG_FILTER,
    };
    EnvFilter::try_new(directives)
        .with_context(|| format!("RUST_LOG không hợp lệ: {directives}"))
}

fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    tracing_subscriber::registry()
        .with(log_filter(rust_log.as_deref())?)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let output = match &cli.command {
        Command::Analyze {
            input,
            store_dir,
            settings,
        } => {
            let text = std::fs::read_to_string(input)
                .with_context(|| format!("Không đọc được file {:?}", input))?;
            let catalog = JsonCatalog::from_path(&settings.catalog);
            let store = store_dir.as_ref().map(DirectoryBatchStore::new);

            let run = analyze_text(
                &text,
                &catalog,
                store.as_ref().map(|store| store as &dyn BatchStore),
                &settings.config(),
            )
            .context("Phân tích thất bại")?;

            if let Some(err) = &run.persistence_error {
                tracing::warn!("Không lưu được batch: {err}");
            }
            for id in &run.batch_ids {
                tracing::info!(batch_id = %id, "stored batch");
            }

            serde_json::to_value(run.response())?
        }
        Command::Reanalyze {
            store_dir,
            ids,
            settings,
        } => {
            let catalog = JsonCatalog::from_path(&settings.catalog);
            let store = DirectoryBatchStore::new(store_dir);
            let ids: Vec<BatchId> = ids.iter().map(BatchId::new).collect();

            let analysis = analyze_stored(&ids, &store, &catalog, &settings.config())
                .context("Phân tích lại thất bại")?;

            serde_json::json!({
                "patients": analysis.summaries,
                "truncated": analysis.truncated,
            })
        }
    };

    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{rendered}");

    Ok(())
}
