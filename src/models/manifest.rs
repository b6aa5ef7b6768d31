use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::params::ParamsSummary;

/// 运行的终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCounts {
    pub stage: String,
    pub produced: usize,
    pub failed: usize,
}

/// 运行摘要，终态时写入 `run_summary.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub inputs: Option<ParamsSummary>,
    pub stage_timings: Vec<StageTiming>,
    pub item_counts: Vec<StageCounts>,
    /// 相对运行目录的产物路径，按产生顺序
    pub artifact_paths: Vec<PathBuf>,
    pub error: Option<String>,
}

impl RunManifest {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Running,
            started_at: Local::now(),
            finished_at: None,
            inputs: None,
            stage_timings: Vec::new(),
            item_counts: Vec::new(),
            artifact_paths: Vec::new(),
            error: None,
        }
    }

    pub fn counts_for(&self, stage: &str) -> Option<&StageCounts> {
        self.item_counts.iter().find(|c| c.stage == stage)
    }

    /// 按扩展名筛选产物，例如下载全部 CSV
    pub fn artifacts_with_extension<'a>(&'a self, ext: &'a str) -> impl Iterator<Item = &'a PathBuf> + 'a {
        self.artifact_paths
            .iter()
            .filter(move |p| p.extension().and_then(|e| e.to_str()) == Some(ext))
    }
}
