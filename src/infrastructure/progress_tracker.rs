//! 进度跟踪器 - 基础设施层
//!
//! ## 职责
//!
//! - 持有进程内唯一的进度状态，写入串行化
//! - 读取方拿到的是完整快照，不会看到半更新的字段
//! - 同一运行内进度百分比单调不减
//!
//! 不做持久化，进程重启后回到 idle。

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::Local;

use crate::error::{AppError, AppResult};
use crate::models::{ProgressState, ProgressStatus};

static GLOBAL_TRACKER: OnceLock<Arc<ProgressTracker>> = OnceLock::new();

#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 进程级共享实例
    pub fn global() -> Arc<ProgressTracker> {
        GLOBAL_TRACKER
            .get_or_init(|| Arc::new(ProgressTracker::new()))
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        // 持锁期间不会 panic，毒化时沿用内部状态
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 原子更新状态
    ///
    /// 运行期间 `percent` 只增不减，超过 100 按 100 处理。
    pub fn update(
        &self,
        status: ProgressStatus,
        stage: Option<&str>,
        percent: u8,
        message: impl Into<String>,
    ) {
        let mut state = self.lock();
        let percent = percent.min(100);
        state.percent = if state.run_id.is_some() {
            state.percent.max(percent)
        } else {
            percent
        };
        state.status = status;
        if stage.is_some() {
            state.current_stage = stage.map(str::to_string);
        }
        state.message = message.into();
        state.updated_at = Local::now();
    }

    /// 开始新运行：状态置为 running，进度归零
    ///
    /// 已有运行处于 running 时返回 `Conflict`。
    pub fn reset(&self, run_id: &str) -> AppResult<()> {
        let mut state = self.lock();
        if state.status == ProgressStatus::Running {
            return Err(AppError::Conflict {
                running: state.run_id.clone().unwrap_or_default(),
            });
        }
        *state = ProgressState {
            status: ProgressStatus::Running,
            current_stage: None,
            percent: 0,
            message: format!("运行 {} 已启动", run_id),
            run_id: Some(run_id.to_string()),
            updated_at: Local::now(),
        };
        Ok(())
    }

    /// 标记运行成功结束
    pub fn mark_completed(&self, message: impl Into<String>) {
        self.update(ProgressStatus::Completed, None, 100, message);
    }

    /// 标记运行失败，保留当前阶段与进度
    pub fn mark_failed(&self, message: impl Into<String>) {
        self.update(ProgressStatus::Failed, None, 0, message);
    }

    /// 未能建立运行时记录失败（没有 run_id）
    pub fn mark_init_failed(&self, message: impl Into<String>) {
        let mut state = self.lock();
        *state = ProgressState {
            status: ProgressStatus::Failed,
            message: message.into(),
            ..ProgressState::default()
        };
    }

    /// 读取快照
    pub fn snapshot(&self) -> ProgressState {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().status == ProgressStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reset_conflicts_while_running() {
        let tracker = ProgressTracker::new();
        tracker.reset("run-a").unwrap();

        let err = tracker.reset("run-b").unwrap_err();
        assert!(matches!(err, AppError::Conflict { ref running } if running == "run-a"));

        tracker.mark_completed("done");
        tracker.reset("run-b").unwrap();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.run_id.as_deref(), Some("run-b"));
        assert_eq!(snapshot.percent, 0);
        assert_eq!(snapshot.status, ProgressStatus::Running);
    }

    #[test]
    fn test_reset_after_failure_succeeds() {
        let tracker = ProgressTracker::new();
        tracker.reset("run-a").unwrap();
        tracker.mark_failed("boom");
        assert!(tracker.reset("run-b").is_ok());
    }

    #[test]
    fn test_percent_is_monotonic_and_clamped() {
        let tracker = ProgressTracker::new();
        tracker.reset("run-a").unwrap();
        tracker.update(ProgressStatus::Running, Some("scrape"), 30, "a");
        tracker.update(ProgressStatus::Running, Some("scrape"), 10, "b");
        assert_eq!(tracker.snapshot().percent, 30);
        assert_eq!(tracker.snapshot().message, "b");

        tracker.update(ProgressStatus::Running, Some("clean"), 250, "c");
        assert_eq!(tracker.snapshot().percent, 100);
    }

    #[test]
    fn test_mark_failed_keeps_stage_and_percent() {
        let tracker = ProgressTracker::new();
        tracker.reset("run-a").unwrap();
        tracker.update(ProgressStatus::Running, Some("recognize"), 55, "识别中");
        tracker.mark_failed("识别失败");

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.status, ProgressStatus::Failed);
        assert_eq!(snapshot.current_stage.as_deref(), Some("recognize"));
        assert_eq!(snapshot.percent, 55);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_snapshots() {
        let tracker = Arc::new(ProgressTracker::new());
        tracker.reset("run-a").unwrap();

        let writer = {
            let tracker = tracker.clone();
            thread::spawn(move || {
                for i in 0..=100u8 {
                    tracker.update(ProgressStatus::Running, Some("scrape"), i, format!("step {}", i));
                }
            })
        };

        let mut last = 0;
        for _ in 0..200 {
            let snapshot = tracker.snapshot();
            assert!(snapshot.percent >= last);
            if snapshot.message.starts_with("step ") {
                assert_eq!(snapshot.message, format!("step {}", snapshot.percent));
            }
            last = snapshot.percent;
        }
        writer.join().unwrap();
    }
}
