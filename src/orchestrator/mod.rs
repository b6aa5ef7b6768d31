//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责运行的生命周期和阶段调度，是整个系统的"指挥中心"。
//!
//! ## 层次关系
//!
//! ```text
//! orchestrator::PipelineOrchestrator (单飞锁 / 运行目录 / 进度终态)
//!     ↓
//! workflow (ScrapeStage → RecognizeStage → CleanStage)
//!     ↓
//! services (能力层：scraper / recognizer / normalizer / csv)
//!     ↓
//! infrastructure (基础设施：PageDriver / RunContext / ProgressTracker)
//! ```
//!
//! ## 设计原则
//!
//! 1. **资源隔离**：只有编排层持有运行锁和取消信号
//! 2. **向下依赖**：编排层 → workflow → services → infrastructure
//! 3. **无业务逻辑**：只做调度和收尾，不做具体识别或换算

pub mod pipeline;

pub use pipeline::{PipelineOrchestrator, RunOutcome, RunTicket};
