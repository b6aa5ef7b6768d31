use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use traffic_graph_ocr::models::load_params;
use traffic_graph_ocr::services::run_catalog;
use traffic_graph_ocr::utils::logging;
use traffic_graph_ocr::{AppError, CactiScraper, Config, PipelineOrchestrator, VisionLlmRecognizer};

const DEFAULT_PARAMS_FILE: &str = "pipeline.toml";

#[tokio::main]
async fn main() -> ExitCode {
    // 加载配置
    let config = Config::from_env();

    // 初始化日志
    if let Err(e) = logging::init(&config) {
        eprintln!("日志初始化失败: {:#}", e);
    }

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.first().map(String::as_str) == Some("--list") {
        list_runs(&config)?;
        return Ok(ExitCode::SUCCESS);
    }

    logging::log_startup(&config);

    let params_file = args.first().map(String::as_str).unwrap_or(DEFAULT_PARAMS_FILE);
    info!("📁 读取运行参数: {}", params_file);
    let params = load_params(Path::new(params_file))
        .await
        .with_context(|| format!("无法加载运行参数 {}", params_file))?;

    let scraper = Arc::new(CactiScraper::new(&config)?);
    let recognizer = Arc::new(VisionLlmRecognizer::new(&config));
    let orchestrator = PipelineOrchestrator::new(config, scraper, recognizer);

    // Ctrl+C 请求取消，当前子项完成后停止
    let canceller = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    match orchestrator.run(params).await {
        Ok(outcome) if outcome.is_success() => Ok(ExitCode::SUCCESS),
        Ok(_) => Ok(ExitCode::from(1)),
        Err(AppError::AlreadyRunning { run_id }) => {
            error!("❌ 已有运行进行中: {:?}", run_id);
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e.into()),
    }
}

fn list_runs(config: &Config) -> Result<()> {
    let listings = run_catalog::list_runs_with_manifests(Path::new(&config.output_root))?;
    if listings.is_empty() {
        info!("📭 {} 下没有运行记录", config.output_root);
        return Ok(());
    }
    for listing in listings {
        let run_id = &listing.entry.run_id;
        match (&listing.manifest, &listing.problem) {
            (Some(manifest), _) => {
                info!("{}  {:?}", run_id, manifest.status);
                for csv in manifest.artifacts_with_extension("csv") {
                    info!("    {}", csv.display());
                }
            }
            (None, Some(problem)) => warn!("{}  (运行摘要损坏: {})", run_id, problem),
            (None, None) => info!("{}  (无运行摘要)", run_id),
        }
    }
    Ok(())
}
