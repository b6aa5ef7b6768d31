//! 流水线编排器 - 编排层
//!
//! ## 职责
//!
//! 1. **单飞执行**：同一时间只允许一个运行，抢锁与"已在运行"判定是同一个原子操作
//! 2. **运行初始化**：分配运行目录、重置进度、登记输入参数
//! 3. **阶段调度**：按 采集 → 识别 → 清洗 顺序执行，任一阶段失败即中止
//! 4. **统一收尾**：无论成功、失败、取消还是 panic，都会写出运行摘要、
//!    更新进度终态，最后才释放运行锁
//!
//! 支持两种调用方式：`run()` 等待运行结束；
//! `start()` 立即返回，调用方通过进度快照或 `RunTicket::wait()` 获取结果。
//! 两种方式下阶段都在独立任务中执行，收尾不依赖调用方是否继续等待。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::infrastructure::{ProgressTracker, RunContext};
use crate::models::{PipelineParams, ProgressState, ProgressStatus, RunStatus};
use crate::services::{GraphScraper, Recognizer, ValueNormalizer};
use crate::utils::logging::{log_run_start, log_stage_complete, log_stage_start, print_run_summary};
use crate::workflow::{CleanStage, RecognizeStage, ScrapeStage, Stage, StageEnv};

/// 当前活动运行
struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
}

type ActiveSlot = Arc<Mutex<Option<ActiveRun>>>;

fn lock_active(active: &ActiveSlot) -> MutexGuard<'_, Option<ActiveRun>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 一次运行的结果
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub root_path: PathBuf,
    /// 运行摘要路径；摘要写入失败时为 None
    pub manifest_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// 后台运行的句柄
pub struct RunTicket {
    pub run_id: String,
    pub root_path: PathBuf,
    handle: JoinHandle<RunOutcome>,
}

impl RunTicket {
    /// 等待后台运行结束
    pub async fn wait(self) -> AppResult<RunOutcome> {
        self.handle
            .await
            .map_err(|e| AppError::StagePanicked(e.to_string()))
    }
}

/// 已完成初始化、尚未执行阶段的运行
///
/// 持有运行锁；在 `execute` 结束前不会释放。
struct PreparedRun {
    ctx: RunContext,
    params: PipelineParams,
    env: StageEnv,
    stages: Vec<Box<dyn Stage>>,
    active: ActiveSlot,
    guard: OwnedMutexGuard<()>,
}

impl PreparedRun {
    async fn execute(mut self) -> RunOutcome {
        let result = AssertUnwindSafe(run_stages(&self.stages, &mut self.ctx, &self.params, &self.env))
            .catch_unwind()
            .await;

        let (status, error) = match result {
            Ok(Ok(())) => (RunStatus::Completed, None),
            Ok(Err(e)) if e.is_cancelled() => {
                warn!("[运行 {}] ⏹ {}", self.ctx.run_id(), e);
                (RunStatus::Cancelled, Some(e.to_string()))
            }
            Ok(Err(e)) => {
                error!("[运行 {}] ❌ {}", self.ctx.run_id(), e);
                (RunStatus::Failed, Some(e.to_string()))
            }
            Err(panic) => {
                let e = AppError::StagePanicked(panic_message(panic.as_ref()));
                error!("[运行 {}] ❌ {}", self.ctx.run_id(), e);
                (RunStatus::Failed, Some(e.to_string()))
            }
        };

        let manifest_path = match self.ctx.finalize(status, error.clone()) {
            Ok(path) => Some(path),
            Err(e) => {
                error!("[运行 {}] ❌ 运行摘要写入失败: {}", self.ctx.run_id(), e);
                None
            }
        };
        print_run_summary(self.ctx.manifest(), self.ctx.root_path());

        let tracker = &self.env.tracker;
        match (status, &error) {
            (RunStatus::Completed, _) => tracker.mark_completed(format!("运行 {} 已完成", self.ctx.run_id())),
            (RunStatus::Cancelled, _) => tracker.mark_failed(format!("运行 {} 已取消", self.ctx.run_id())),
            (_, reason) => tracker.mark_failed(reason.clone().unwrap_or_else(|| "运行失败".to_string())),
        }

        {
            let mut active = lock_active(&self.active);
            if active.as_ref().is_some_and(|run| run.run_id == self.ctx.run_id()) {
                *active = None;
            }
        }

        let outcome = RunOutcome {
            run_id: self.ctx.run_id().to_string(),
            status,
            root_path: self.ctx.root_path().to_path_buf(),
            manifest_path,
            error,
        };
        // 进度终态写入之后才释放运行锁
        drop(self.guard);
        outcome
    }
}

/// 依次执行各阶段，记录耗时与计数
async fn run_stages(
    stages: &[Box<dyn Stage>],
    ctx: &mut RunContext,
    params: &PipelineParams,
    env: &StageEnv,
) -> AppResult<()> {
    let total = stages.len();
    for (index, stage) in stages.iter().enumerate() {
        let kind = stage.kind();
        env.check_cancelled(kind, 0, 0)?;

        let (start_percent, _) = kind.percent_span();
        env.tracker.update(
            ProgressStatus::Running,
            Some(kind.name()),
            start_percent,
            format!("阶段 {} 开始", kind),
        );
        log_stage_start(ctx.run_id(), kind.name(), index + 1, total);

        let started = Instant::now();
        let result = stage.run(ctx, params, env).await;
        let elapsed = started.elapsed();
        ctx.record_stage_timing(kind.name(), elapsed);

        match result {
            Ok(stage_result) => {
                ctx.record_counts(kind.name(), stage_result.produced_count, stage_result.failed_count);
                log_stage_complete(
                    ctx.run_id(),
                    kind.name(),
                    stage_result.produced_count,
                    stage_result.failed_count,
                    elapsed.as_millis() as u64,
                );
            }
            Err(e) => {
                if let Some((produced, failed)) = e.partial_counts() {
                    ctx.record_counts(kind.name(), produced, failed);
                }
                error!("[运行 {}] ❌ 阶段 {} 失败: {}", ctx.run_id(), kind, e);
                return Err(e);
            }
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}

/// 流水线编排器
///
/// 持有协作方和运行锁，可在多个任务间共享（内部均为 `Arc`）。
#[derive(Clone)]
pub struct PipelineOrchestrator {
    config: Arc<Config>,
    tracker: Arc<ProgressTracker>,
    scraper: Arc<dyn GraphScraper>,
    recognizer: Arc<dyn Recognizer>,
    normalizer: Arc<ValueNormalizer>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    active: ActiveSlot,
}

impl PipelineOrchestrator {
    /// 使用进程级共享的进度跟踪器
    pub fn new(config: Config, scraper: Arc<dyn GraphScraper>, recognizer: Arc<dyn Recognizer>) -> Self {
        Self::with_tracker(config, scraper, recognizer, ProgressTracker::global())
    }

    pub fn with_tracker(
        config: Config,
        scraper: Arc<dyn GraphScraper>,
        recognizer: Arc<dyn Recognizer>,
        tracker: Arc<ProgressTracker>,
    ) -> Self {
        let normalizer = Arc::new(ValueNormalizer::new(config.unit_heuristic()));
        Self {
            config: Arc::new(config),
            tracker,
            scraper,
            recognizer,
            normalizer,
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        self.tracker.clone()
    }

    /// 当前进度快照
    pub fn progress(&self) -> ProgressState {
        self.tracker.snapshot()
    }

    pub fn active_run_id(&self) -> Option<String> {
        lock_active(&self.active).as_ref().map(|run| run.run_id.clone())
    }

    /// 请求取消当前运行
    ///
    /// # 返回
    /// 有活动运行时返回 true；阶段会在下一个子项之前停止
    pub fn cancel(&self) -> bool {
        match lock_active(&self.active).as_ref() {
            Some(run) => {
                info!("[运行 {}] ⏹ 收到取消请求", run.run_id);
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// 执行一次完整运行并等待结束
    ///
    /// 参数错误、已有运行、运行目录无法创建时返回 `Err`；
    /// 运行开始后的失败体现在 `RunOutcome::status` 中。
    /// 运行本身在独立任务中执行，调用方丢弃这个 future 时运行照常收尾。
    pub async fn run(&self, params: PipelineParams) -> AppResult<RunOutcome> {
        self.start(params)?.wait().await
    }

    /// 在后台启动一次运行，立即返回运行 id
    pub fn start(&self, params: PipelineParams) -> AppResult<RunTicket> {
        let prepared = self.prepare(params)?;
        let run_id = prepared.ctx.run_id().to_string();
        let root_path = prepared.ctx.root_path().to_path_buf();
        let handle = tokio::spawn(prepared.execute());
        Ok(RunTicket {
            run_id,
            root_path,
            handle,
        })
    }

    fn build_stages(&self) -> Vec<Box<dyn Stage>> {
        vec![
            Box::new(ScrapeStage::new(self.scraper.clone(), self.config.retry_policy())),
            Box::new(RecognizeStage::new(
                self.recognizer.clone(),
                self.normalizer.clone(),
                self.config.ocr_workers,
                self.config.ocr_timeout(),
            )),
            Box::new(CleanStage::new()),
        ]
    }

    fn prepare(&self, params: PipelineParams) -> AppResult<PreparedRun> {
        params.validate().map_err(AppError::InvalidParams)?;
        self.config
            .validate_target_url(&params.target_url)
            .map_err(AppError::InvalidParams)?;

        let guard = match self.run_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                let run_id = self.active_run_id();
                warn!("⚠️ 已有运行进行中，拒绝新的请求 (run_id: {:?})", run_id);
                return Err(AppError::AlreadyRunning { run_id });
            }
        };

        let mut ctx = match RunContext::allocate(Path::new(&self.config.output_root)) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("❌ 无法创建运行目录: {}", e);
                self.tracker.mark_init_failed(e.to_string());
                return Err(e);
            }
        };

        if let Err(e) = self.tracker.reset(ctx.run_id()) {
            error!("[运行 {}] ❌ {}", ctx.run_id(), e);
            if let Err(finalize_err) = ctx.finalize(RunStatus::Failed, Some(e.to_string())) {
                error!("[运行 {}] ❌ 运行摘要写入失败: {}", ctx.run_id(), finalize_err);
            }
            return Err(e);
        }

        ctx.set_inputs(params.summary());
        let cancel = CancellationToken::new();
        *lock_active(&self.active) = Some(ActiveRun {
            run_id: ctx.run_id().to_string(),
            cancel: cancel.clone(),
        });
        log_run_start(ctx.run_id(), &params);

        Ok(PreparedRun {
            env: StageEnv::new(self.tracker.clone(), cancel, self.config.failure_policy()),
            stages: self.build_stages(),
            active: self.active.clone(),
            ctx,
            params,
            guard,
        })
    }
}
