//! 阶段契约
//!
//! 每个阶段：
//! - 只在运行目录内读写
//! - 每完成一个子项就汇报进度
//! - 子项失败计入 `failed`，失败率超过阈值时立即失败
//! - 子项之间检查取消信号

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::infrastructure::{ProgressTracker, RunContext};
use crate::models::{PipelineParams, ProgressStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Scrape,
    Recognize,
    Clean,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Scrape => "scrape",
            StageKind::Recognize => "recognize",
            StageKind::Clean => "clean",
        }
    }

    /// 阶段在整体进度中占的区间
    pub fn percent_span(self) -> (u8, u8) {
        match self {
            StageKind::Scrape => (0, 45),
            StageKind::Recognize => (45, 90),
            StageKind::Clean => (90, 100),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 阶段结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageResult {
    pub produced_count: usize,
    pub failed_count: usize,
    /// 本阶段登记的产物（相对运行目录）
    pub artifacts: Vec<PathBuf>,
}

/// 子项失败率策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailurePolicy {
    pub max_failure_rate: f64,
}

impl FailurePolicy {
    pub fn new(max_failure_rate: f64) -> Self {
        Self {
            max_failure_rate: max_failure_rate.clamp(0.0, 1.0),
        }
    }

    /// 失败数是否已经注定超过阈值
    ///
    /// 按子项总数计算，与子项完成顺序无关；一旦成立，
    /// 阶段结束时的失败率必然超限，因此可以提前失败。
    pub fn exceeded(&self, failed: usize, total: usize) -> bool {
        total > 0 && failed as f64 > self.max_failure_rate * total as f64
    }

    pub fn check(&self, stage: StageKind, produced: usize, failed: usize, total: usize) -> AppResult<()> {
        if self.exceeded(failed, total) {
            return Err(AppError::StageFailureThresholdExceeded {
                stage: stage.name().to_string(),
                produced,
                failed,
                total,
                max_failure_rate: self.max_failure_rate,
            });
        }
        Ok(())
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::new(0.5)
    }
}

/// 阶段运行环境：进度、取消、失败策略
#[derive(Clone)]
pub struct StageEnv {
    pub tracker: Arc<ProgressTracker>,
    pub cancel: CancellationToken,
    pub policy: FailurePolicy,
}

impl StageEnv {
    pub fn new(tracker: Arc<ProgressTracker>, cancel: CancellationToken, policy: FailurePolicy) -> Self {
        Self {
            tracker,
            cancel,
            policy,
        }
    }

    /// 汇报阶段内进度
    ///
    /// # 参数
    /// - `done`: 已完成的子项数
    /// - `total`: 子项总数（为 0 时视为阶段完成）
    pub fn report(&self, stage: StageKind, done: usize, total: usize, message: impl Into<String>) {
        let (start, end) = stage.percent_span();
        let span = usize::from(end - start);
        let offset = if total == 0 {
            span
        } else {
            span * done.min(total) / total
        };
        // offset <= span <= 100
        let percent = start + offset as u8;
        self.tracker
            .update(ProgressStatus::Running, Some(stage.name()), percent, message);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 子项之间调用：已取消时返回 `Cancelled`
    pub fn check_cancelled(&self, stage: StageKind, produced: usize, failed: usize) -> AppResult<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled {
                stage: stage.name().to_string(),
                produced,
                failed,
            });
        }
        Ok(())
    }
}

/// 阶段
///
/// 阶段在登记产物时直接写入 `RunContext`，失败时已写出的产物仍保留在摘要中。
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn run<'a>(
        &'a self,
        ctx: &'a mut RunContext,
        params: &'a PipelineParams,
        env: &'a StageEnv,
    ) -> BoxFuture<'a, AppResult<StageResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_policy_is_order_independent() {
        let policy = FailurePolicy::new(0.5);
        // 10 个子项失败 3 个：无论先后都不超限
        for failed in 0..=3 {
            assert!(!policy.exceeded(failed, 10));
        }
        assert!(!policy.exceeded(5, 10));
        assert!(policy.exceeded(6, 10));
        assert!(!policy.exceeded(0, 0));
    }

    #[test]
    fn test_failure_policy_error_carries_counts() {
        let err = FailurePolicy::new(0.2)
            .check(StageKind::Recognize, 1, 3, 10)
            .unwrap_err();
        assert_eq!(err.partial_counts(), Some((1, 3)));
    }

    #[test]
    fn test_report_maps_into_stage_span() {
        let tracker = Arc::new(ProgressTracker::new());
        tracker.reset("run").unwrap();
        let env = StageEnv::new(tracker.clone(), CancellationToken::new(), FailurePolicy::default());

        env.report(StageKind::Recognize, 5, 10, "识别中");
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.percent, 67);
        assert_eq!(snapshot.current_stage.as_deref(), Some("recognize"));

        env.report(StageKind::Clean, 0, 0, "无数据");
        assert_eq!(tracker.snapshot().percent, 100);
    }

    #[test]
    fn test_check_cancelled() {
        let env = StageEnv::new(
            Arc::new(ProgressTracker::new()),
            CancellationToken::new(),
            FailurePolicy::default(),
        );
        assert!(env.check_cancelled(StageKind::Scrape, 0, 0).is_ok());
        env.cancel.cancel();
        assert!(env.check_cancelled(StageKind::Scrape, 2, 1).unwrap_err().is_cancelled());
    }
}
