//! 错误类型
//!
//! 按照流水线的失败语义划分：
//! - 子项级错误（单张图片、单个设备）在阶段内部被吸收并计数
//! - 阶段级 / 运行级错误向上传播到编排层，由编排层统一收尾

use std::path::PathBuf;

use thiserror::Error;

/// 外部协作方（浏览器采集、HTTP 下载）返回的错误
///
/// 调用方根据 `is_transient()` 决定是否按退避策略重试。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// 网络抖动、超时、页面未及时响应等，可重试
    #[error("临时性错误: {0}")]
    Transient(String),
    /// 登录失败、页面结构不符合预期等，不可重试
    #[error("致命错误: {0}")]
    Fatal(String),
    /// 目标设备没有图表数据
    #[error("无数据: {0}")]
    NoData(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Transient(_))
    }
}

/// 单张图片识别失败（对整个运行非致命）
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("识别失败 ({image}): {reason}")]
pub struct RecognitionError {
    pub image: String,
    pub reason: String,
}

impl RecognitionError {
    pub fn new(image: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            reason: reason.into(),
        }
    }
}

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 已有运行在进行中（只对新请求致命）
    #[error("已有流水线在运行中 (run_id: {})", .run_id.as_deref().unwrap_or("未知"))]
    AlreadyRunning { run_id: Option<String> },

    /// 进度状态冲突：上一个运行仍处于 running
    #[error("进度状态冲突: 运行 {running} 尚未结束")]
    Conflict { running: String },

    /// 无法创建运行目录
    #[error("无法初始化运行目录 {}: {reason}", .path.display())]
    RunInit { path: PathBuf, reason: String },

    /// 阶段失败率超过阈值，中止剩余阶段
    #[error(
        "阶段 {stage} 失败率超限: 失败 {failed} / 共 {total} (阈值 {:.0}%)",
        .max_failure_rate * 100.0
    )]
    StageFailureThresholdExceeded {
        stage: String,
        produced: usize,
        failed: usize,
        total: usize,
        max_failure_rate: f64,
    },

    /// 收到取消信号
    #[error("流水线已取消 (阶段: {stage})")]
    Cancelled {
        stage: String,
        produced: usize,
        failed: usize,
    },

    /// 外部协作方错误（已耗尽重试或不可重试）
    #[error("外部协作方错误: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Recognition(#[from] RecognitionError),

    /// 试图在运行目录之外登记产物
    #[error("路径 {} 不在运行目录 {} 之内", .path.display(), .root.display())]
    PathOutsideRun { path: PathBuf, root: PathBuf },

    /// 运行参数不合法
    #[error("参数错误: {0}")]
    InvalidParams(String),

    /// 阶段执行过程中发生 panic
    #[error("阶段执行异常: {0}")]
    StagePanicked(String),

    #[error("文件错误 ({}): {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML 解析失败: {0}")]
    Toml(#[from] toml::de::Error),
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建带路径信息的文件错误
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppError::File {
            path: path.into(),
            source,
        }
    }

    /// 阶段中止时已经产生的 (成功数, 失败数)
    ///
    /// 编排层据此把部分计数写入运行摘要。
    pub fn partial_counts(&self) -> Option<(usize, usize)> {
        match self {
            AppError::StageFailureThresholdExceeded {
                produced, failed, ..
            }
            | AppError::Cancelled {
                produced, failed, ..
            } => Some((*produced, *failed)),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled { .. })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
