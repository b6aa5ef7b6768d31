//! 识别阶段
//!
//! 对 `raw_screenshots/` 中的每张图片并发识别（有界并发），
//! 提取流量字段，结果写入 `processed_output/recognized.json` 与 `processed_output/ocr_raw.csv`。
//! 进度汇报和计数都在当前任务中串行进行。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, RecognitionError};
use crate::infrastructure::run_context::{PROCESSED_OUTPUT_DIR, RAW_SCREENSHOTS_DIR};
use crate::infrastructure::RunContext;
use crate::models::{PipelineParams, TextRegion, TrafficRecord};
use crate::services::csv_writer::{raw_row, CsvTable, FULL_COLUMNS};
use crate::services::traffic_extractor::extract_record;
use crate::services::{Recognizer, ValueNormalizer};
use crate::workflow::scrape_stage::load_scrape_report;
use crate::workflow::stage::{Stage, StageEnv, StageKind, StageResult};

pub const RECOGNIZED_FILE: &str = "recognized.json";
pub const OCR_RAW_FILE: &str = "ocr_raw.csv";

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

/// 待识别的图片
#[derive(Debug, Clone)]
struct ImageJob {
    index: usize,
    device_label: String,
    /// 相对运行目录
    relative: PathBuf,
    absolute: PathBuf,
}

/// 识别任务的返回；`None` 表示因取消而跳过
type JobOutput = (ImageJob, Option<Result<Vec<TextRegion>, RecognitionError>>);

pub struct RecognizeStage {
    recognizer: Arc<dyn Recognizer>,
    normalizer: Arc<ValueNormalizer>,
    workers: usize,
    timeout: Duration,
}

impl RecognizeStage {
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        normalizer: Arc<ValueNormalizer>,
        workers: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            recognizer,
            normalizer,
            workers: workers.max(1),
            timeout,
        }
    }

    /// 列出待识别图片，按文件名排序；设备名优先取采集报告中的记录
    fn collect_jobs(ctx: &RunContext) -> AppResult<Vec<ImageJob>> {
        let images_dir = ctx.scoped_path(RAW_SCREENSHOTS_DIR)?;
        let labels: HashMap<PathBuf, String> = load_scrape_report(ctx)?
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| entry.image.map(|image| (image, entry.device_label)))
            .collect();

        let entries = match std::fs::read_dir(&images_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::file(&images_dir, e)),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();

        Ok(files
            .into_iter()
            .enumerate()
            .filter_map(|(index, absolute)| {
                let file_name = absolute.file_name()?.to_owned();
                let relative = Path::new(RAW_SCREENSHOTS_DIR).join(file_name);
                let device_label = labels.get(&relative).cloned().unwrap_or_else(|| {
                    absolute
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default()
                });
                Some(ImageJob {
                    index,
                    device_label,
                    relative,
                    absolute,
                })
            })
            .collect())
    }

    fn spawn_jobs(&self, jobs: Vec<ImageJob>, env: &StageEnv) -> JoinSet<JobOutput> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();
        for job in jobs {
            let semaphore = semaphore.clone();
            let recognizer = self.recognizer.clone();
            let cancel = env.cancel.clone();
            let timeout = self.timeout;
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (job, None);
                };
                if cancel.is_cancelled() {
                    return (job, None);
                }
                debug!("开始识别: {}", job.relative.display());
                let result = match tokio::time::timeout(timeout, recognizer.recognize(&job.absolute)).await {
                    Ok(result) => result,
                    Err(_) => Err(RecognitionError::new(
                        job.relative.display().to_string(),
                        format!("识别超时 ({} 秒)", timeout.as_secs()),
                    )),
                };
                (job, Some(result))
            });
        }
        set
    }

    fn write_outputs(ctx: &mut RunContext, records: &[TrafficRecord]) -> AppResult<Vec<PathBuf>> {
        let out_dir = ctx.ensure_subdir(PROCESSED_OUTPUT_DIR)?;

        let json_path = out_dir.join(RECOGNIZED_FILE);
        let json = serde_json::to_vec_pretty(records)?;
        std::fs::write(&json_path, json).map_err(|e| AppError::file(&json_path, e))?;

        let mut table = CsvTable::new(&FULL_COLUMNS);
        for record in records {
            table.push_row(raw_row(record));
        }
        let csv_path = out_dir.join(OCR_RAW_FILE);
        table.write_to(&csv_path)?;

        Ok(vec![
            ctx.record_artifact(&json_path)?,
            ctx.record_artifact(&csv_path)?,
        ])
    }
}

impl Stage for RecognizeStage {
    fn kind(&self) -> StageKind {
        StageKind::Recognize
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut RunContext,
        _params: &'a PipelineParams,
        env: &'a StageEnv,
    ) -> BoxFuture<'a, AppResult<StageResult>> {
        async move {
            let kind = self.kind();
            env.check_cancelled(kind, 0, 0)?;

            let jobs = Self::collect_jobs(ctx)?;
            let total = jobs.len();
            info!("🔍 待识别图片 {} 张，并发 {}", total, self.workers);
            env.report(kind, 0, total, format!("开始识别 {} 张图片", total));

            let mut set = self.spawn_jobs(jobs, env);
            let mut records: Vec<(usize, TrafficRecord)> = Vec::with_capacity(total);
            let (mut produced, mut failed, mut done) = (0usize, 0usize, 0usize);
            let mut outcome: AppResult<()> = Ok(());

            while let Some(joined) = set.join_next().await {
                let (job, result) = match joined {
                    Ok(output) => output,
                    Err(e) => {
                        warn!("⚠️ 识别任务异常退出: {}", e);
                        done += 1;
                        failed += 1;
                        if let Err(e) = env.policy.check(kind, produced, failed, total) {
                            set.abort_all();
                            outcome = Err(e);
                            break;
                        }
                        continue;
                    }
                };
                let Some(result) = result else {
                    continue;
                };
                done += 1;

                let record = match result {
                    Ok(regions) => extract_record(&job.device_label, &job.relative, &regions, &self.normalizer),
                    Err(e) => TrafficRecord {
                        device_label: job.device_label.clone(),
                        source_image: job.relative.clone(),
                        error: Some(e.to_string()),
                        ..TrafficRecord::default()
                    },
                };
                match &record.error {
                    None => {
                        produced += 1;
                        info!("[设备 {}] ✓ 识别完成", job.device_label);
                    }
                    Some(reason) => {
                        failed += 1;
                        warn!("[设备 {}] ⚠️ {}", job.device_label, reason);
                    }
                }
                records.push((job.index, record));

                env.report(
                    kind,
                    done,
                    total,
                    format!("已识别 {}/{} (失败 {})", done, total, failed),
                );
                if let Err(e) = env.policy.check(kind, produced, failed, total) {
                    set.abort_all();
                    outcome = Err(e);
                    break;
                }
            }

            if outcome.is_ok() && done < total && env.is_cancelled() {
                outcome = env.check_cancelled(kind, produced, failed);
            }

            // 部分结果同样落盘
            records.sort_by_key(|(index, _)| *index);
            let records: Vec<TrafficRecord> = records.into_iter().map(|(_, r)| r).collect();
            let artifacts = Self::write_outputs(ctx, &records)?;
            outcome?;

            Ok(StageResult {
                produced_count: produced,
                failed_count: failed,
                artifacts,
            })
        }
        .boxed()
    }
}
