//! 采集阶段
//!
//! 一次登录会话内逐个设备采集图表，图片写入 `raw_screenshots/`，
//! 每个设备的结果写入 `scrape_report.json`。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult, CollaboratorError};
use crate::infrastructure::run_context::{DIAGNOSTICS_DIR, RAW_SCREENSHOTS_DIR};
use crate::infrastructure::RunContext;
use crate::models::PipelineParams;
use crate::services::{GraphScraper, ScrapeRequest};
use crate::utils::retry::{retry_with_backoff, RetryPolicy};
use crate::workflow::stage::{Stage, StageEnv, StageKind, StageResult};

pub const SCRAPE_REPORT_FILE: &str = "scrape_report.json";

/// 单个设备的采集结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeReportEntry {
    pub device_label: String,
    /// 相对运行目录的图片路径
    pub image: Option<PathBuf>,
    pub error: Option<String>,
}

#[derive(Default)]
struct ScrapeTally {
    produced: usize,
    failed: usize,
    artifacts: Vec<PathBuf>,
    entries: Vec<ScrapeReportEntry>,
}

pub struct ScrapeStage {
    scraper: Arc<dyn GraphScraper>,
    retry: RetryPolicy,
}

impl ScrapeStage {
    pub fn new(scraper: Arc<dyn GraphScraper>, retry: RetryPolicy) -> Self {
        Self { scraper, retry }
    }

    async fn capture_devices(
        &self,
        ctx: &mut RunContext,
        devices: &[String],
        images_dir: &Path,
        diagnostics_dir: &Path,
        env: &StageEnv,
        tally: &mut ScrapeTally,
    ) -> AppResult<()> {
        let kind = StageKind::Scrape;
        let total = devices.len();

        for (index, device) in devices.iter().enumerate() {
            env.check_cancelled(kind, tally.produced, tally.failed)?;
            env.report(
                kind,
                index,
                total,
                format!("正在采集 {} ({}/{})", device, index + 1, total),
            );

            let result = retry_with_backoff(
                &self.retry,
                &format!("采集 {}", device),
                || self.scraper.capture_graph(device, images_dir, diagnostics_dir),
                CollaboratorError::is_transient,
                &env.cancel,
            )
            .await
            .map_err(AppError::from)
            .and_then(|path| ctx.record_artifact(&path));

            // 重试等待中被取消：本设备不计入失败
            if result.is_err() {
                env.check_cancelled(kind, tally.produced, tally.failed)?;
            }

            match result {
                Ok(relative) => {
                    info!("[设备 {}] ✓ 图表已采集: {}", device, relative.display());
                    tally.produced += 1;
                    tally.artifacts.push(relative.clone());
                    tally.entries.push(ScrapeReportEntry {
                        device_label: device.clone(),
                        image: Some(relative),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!("[设备 {}] ⚠️ 采集失败: {}", device, e);
                    tally.failed += 1;
                    tally.entries.push(ScrapeReportEntry {
                        device_label: device.clone(),
                        image: None,
                        error: Some(e.to_string()),
                    });
                }
            }

            env.report(
                kind,
                index + 1,
                total,
                format!("已采集 {}/{} (失败 {})", index + 1, total, tally.failed),
            );
            env.policy.check(kind, tally.produced, tally.failed, total)?;
        }
        Ok(())
    }

    fn write_report(ctx: &mut RunContext, tally: &mut ScrapeTally) -> AppResult<()> {
        let path = ctx.scoped_path(SCRAPE_REPORT_FILE)?;
        let json = serde_json::to_vec_pretty(&tally.entries)?;
        std::fs::write(&path, json).map_err(|e| AppError::file(&path, e))?;
        tally.artifacts.push(ctx.record_artifact(&path)?);
        Ok(())
    }

    /// 登记采集器写下的诊断截图
    fn record_diagnostics(ctx: &mut RunContext, diagnostics_dir: &Path, tally: &mut ScrapeTally) {
        let Ok(entries) = std::fs::read_dir(diagnostics_dir) else {
            return;
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        for path in paths {
            if let Ok(relative) = ctx.record_artifact(&path) {
                tally.artifacts.push(relative);
            }
        }
    }
}

/// 读取采集报告，用于识别阶段还原设备名
pub fn load_scrape_report(ctx: &RunContext) -> AppResult<Option<Vec<ScrapeReportEntry>>> {
    let path = ctx.scoped_path(SCRAPE_REPORT_FILE)?;
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| AppError::file(&path, e))?;
    Ok(Some(serde_json::from_str(&content)?))
}

impl Stage for ScrapeStage {
    fn kind(&self) -> StageKind {
        StageKind::Scrape
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut RunContext,
        params: &'a PipelineParams,
        env: &'a StageEnv,
    ) -> BoxFuture<'a, AppResult<StageResult>> {
        async move {
            let kind = self.kind();
            let devices = params.device_list();
            let images_dir = ctx.ensure_subdir(RAW_SCREENSHOTS_DIR)?;
            let diagnostics_dir = ctx.ensure_subdir(DIAGNOSTICS_DIR)?;

            let request = ScrapeRequest {
                target_url: params.target_url.clone(),
                username: params.username.clone(),
                password: params.password.clone(),
                date_from: params.date_from.clone(),
                date_to: params.date_to.clone(),
            };

            env.check_cancelled(kind, 0, 0)?;
            env.report(kind, 0, devices.len(), format!("正在登录 {}", params.target_url));
            if let Err(e) = retry_with_backoff(
                &self.retry,
                "登录监控平台",
                || self.scraper.open_session(&request),
                CollaboratorError::is_transient,
                &env.cancel,
            )
            .await
            {
                self.scraper.close_session().await;
                env.check_cancelled(kind, 0, 0)?;
                error!("❌ 无法建立采集会话: {}", e);
                return Err(AppError::Collaborator(e));
            }

            let mut tally = ScrapeTally::default();
            let outcome = self
                .capture_devices(ctx, &devices, &images_dir, &diagnostics_dir, env, &mut tally)
                .await;
            self.scraper.close_session().await;

            Self::record_diagnostics(ctx, &diagnostics_dir, &mut tally);
            Self::write_report(ctx, &mut tally)?;
            outcome?;

            Ok(StageResult {
                produced_count: tally.produced,
                failed_count: tally.failed,
                artifacts: tally.artifacts,
            })
        }
        .boxed()
    }
}
