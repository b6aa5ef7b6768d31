/// 日志工具模块
///
/// 负责订阅器初始化，以及流水线各节点的日志格式
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{mask_sensitive, Config};
use crate::models::{PipelineParams, RunManifest};

/// 初始化日志订阅器
///
/// 控制台输出始终开启；配置了 `log_dir` 时额外写一份纯文本日志。
/// `RUST_LOG` 优先，其次由 `verbose_logging` 决定 debug / info。
///
/// # 返回
/// 返回日志文件路径（未写文件时为 None）
pub fn init(config: &Config) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if config.verbose_logging { "debug" } else { "info" })
    });

    let log_file_path = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("无法创建日志目录: {}", dir))?;
            Some(PathBuf::from(dir).join(format!(
                "pipeline_{}.log",
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            )))
        }
        None => None,
    };

    let file_layer = match &log_file_path {
        Some(path) => {
            let file = fs::File::create(path)
                .with_context(|| format!("无法创建日志文件: {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .context("日志订阅器已经初始化")?;

    Ok(log_file_path)
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 流量图识别流水线");
    info!("📁 输出目录: {}", config.output_root);
    info!("🧵 识别并发数: {}", config.ocr_workers);
    info!(
        "📏 单位推断阈值: {} (低于 → {}, 不低于 → {})",
        config.unit_threshold, config.unit_below_threshold, config.unit_at_or_above_threshold
    );
    info!("{}", "=".repeat(60));
}

/// 记录运行开始
pub fn log_run_start(run_id: &str, params: &PipelineParams) {
    info!("\n{}", "=".repeat(60));
    info!("▶ 运行 {} 开始", run_id);
    info!("🌐 目标: {}", params.target_url);
    info!("👤 用户: {}", mask_sensitive(&params.username));
    info!("📄 设备: {} 个", params.device_list().len());
    info!("🕒 时间范围: {} ~ {}", params.date_from, params.date_to);
    info!("{}", "=".repeat(60));
}

/// 记录阶段开始
///
/// # 参数
/// - `index`: 阶段序号（从 1 开始）
/// - `total`: 阶段总数
pub fn log_stage_start(run_id: &str, stage: &str, index: usize, total: usize) {
    info!("\n{}", "─".repeat(60));
    info!("[运行 {}] 📦 阶段 {}/{}: {}", run_id, index, total, stage);
    info!("{}", "─".repeat(60));
}

/// 记录阶段完成
pub fn log_stage_complete(run_id: &str, stage: &str, produced: usize, failed: usize, elapsed_ms: u64) {
    info!(
        "[运行 {}] ✓ 阶段 {} 完成: 成功 {} / 失败 {} ({} ms)",
        run_id, stage, produced, failed, elapsed_ms
    );
}

/// 打印运行摘要
pub fn print_run_summary(manifest: &RunManifest, root_path: &std::path::Path) {
    info!("\n{}", "=".repeat(60));
    info!("📊 运行 {} 结束: {:?}", manifest.run_id, manifest.status);
    if let Some(finished) = manifest.finished_at {
        info!("完成时间: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    info!("{}", "=".repeat(60));
    for counts in &manifest.item_counts {
        info!("  {:<10} 成功 {:>4}  失败 {:>4}", counts.stage, counts.produced, counts.failed);
    }
    if let Some(error) = &manifest.error {
        info!("❌ 失败原因: {}", error);
    }
    info!("{}", "=".repeat(60));
    info!("\n产物已保存至: {}", root_path.display());
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("Inbound Current", 7), "Inbound...");
        assert_eq!(truncate_text("短文本", 10), "短文本");
    }
}
