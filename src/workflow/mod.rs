//! 流程层（Workflow Layer）
//!
//! 定义流水线的三个阶段：采集 → 识别 → 清洗。
//! 每个阶段只描述"一次运行中这一步怎么做"，资源和调度交给编排层。

pub mod clean_stage;
pub mod recognize_stage;
pub mod scrape_stage;
pub mod stage;

pub use clean_stage::CleanStage;
pub use recognize_stage::RecognizeStage;
pub use scrape_stage::{ScrapeReportEntry, ScrapeStage};
pub use stage::{FailurePolicy, Stage, StageEnv, StageKind, StageResult};
