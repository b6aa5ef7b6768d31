//! # Traffic Graph OCR
//!
//! 从 CACTI 监控平台批量采集设备流量图，识别图中的流量数值，
//! 清洗换算后输出 CSV。
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源，只暴露能力
//! - `PageDriver` - 浏览器页面的唯一持有者，提供导航 / eval / 截图
//! - `RunContext` - 一次运行的目录与运行摘要
//! - `ProgressTracker` - 线程安全的进度快照
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单个设备或单张图片
//! - `CactiScraper` - 登录并下载图表
//! - `VisionLlmRecognizer` - 图片文字识别
//! - `ValueNormalizer` - 文本纠错、数值解析、单位换算
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义每个阶段在一次运行中的完整处理流程
//! - `ScrapeStage` → `RecognizeStage` → `CleanStage`
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/pipeline` - 单飞执行、阶段调度、取消与统一收尾
//!
//! ## 模块结构

pub mod browser;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult, CollaboratorError, RecognitionError};
pub use infrastructure::{ProgressTracker, RunContext};
pub use models::{PipelineParams, ProgressState, ProgressStatus, RunManifest, RunStatus, TargetUnit};
pub use orchestrator::{PipelineOrchestrator, RunOutcome, RunTicket};
pub use services::{CactiScraper, GraphScraper, Recognizer, ValueNormalizer, VisionLlmRecognizer};
