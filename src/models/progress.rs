use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// 对外暴露的进度快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub status: ProgressStatus,
    pub current_stage: Option<String>,
    /// 同一运行内单调不减，范围 0..=100
    pub percent: u8,
    pub message: String,
    pub run_id: Option<String>,
    pub updated_at: DateTime<Local>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            status: ProgressStatus::Idle,
            current_stage: None,
            percent: 0,
            message: "就绪".to_string(),
            run_id: None,
            updated_at: Local::now(),
        }
    }
}

impl ProgressState {
    pub fn is_running(&self) -> bool {
        self.status == ProgressStatus::Running
    }
}
