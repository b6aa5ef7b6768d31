//! 运行上下文 - 基础设施层
//!
//! ## 职责
//!
//! - 独占一个运行目录，所有阶段的产物都写在它下面
//! - 累积运行摘要（输入、计数、耗时、产物路径），只追加不修改
//! - 终态时把摘要写入 `run_summary.json`，重复调用无副作用
//!
//! 运行目录一经创建就不会被复用：目录已存在即视为初始化失败。

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::models::{ParamsSummary, RunManifest, RunStatus, StageCounts, StageTiming};

pub const MANIFEST_FILE: &str = "run_summary.json";
pub const RAW_SCREENSHOTS_DIR: &str = "raw_screenshots";
pub const PROCESSED_OUTPUT_DIR: &str = "processed_output";
pub const DIAGNOSTICS_DIR: &str = "diagnostics";

/// 同一毫秒内重复 id 时最多尝试的后缀数
const MAX_ID_SUFFIX: usize = 100;

#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    root_path: PathBuf,
    manifest: RunManifest,
    finalized: bool,
}

impl RunContext {
    /// 以时间戳生成运行 id（毫秒精度）
    pub fn new_run_id() -> String {
        Local::now().format("%Y-%m-%d_%H-%M-%S-%3f").to_string()
    }

    /// 独占创建运行目录
    ///
    /// # 参数
    /// - `output_root`: 所有运行目录的父目录，不存在时自动创建
    /// - `run_id`: 运行 id，同时作为目录名
    ///
    /// # 返回
    /// 目录已存在或无法创建时返回 `RunInit`
    pub fn create(output_root: &Path, run_id: &str) -> AppResult<Self> {
        if run_id.is_empty() || Path::new(run_id).components().count() != 1 {
            return Err(AppError::RunInit {
                path: output_root.join(run_id),
                reason: "运行 id 不能包含路径分隔符".to_string(),
            });
        }

        std::fs::create_dir_all(output_root).map_err(|e| AppError::RunInit {
            path: output_root.to_path_buf(),
            reason: e.to_string(),
        })?;

        let root_path = output_root.join(run_id);
        std::fs::create_dir(&root_path).map_err(|e| AppError::RunInit {
            path: root_path.clone(),
            reason: if e.kind() == ErrorKind::AlreadyExists {
                "运行目录已存在".to_string()
            } else {
                e.to_string()
            },
        })?;

        debug!("运行目录已创建: {}", root_path.display());

        Ok(Self {
            run_id: run_id.to_string(),
            root_path,
            manifest: RunManifest::new(run_id),
            finalized: false,
        })
    }

    /// 以当前时间分配新的运行目录，冲突时追加 `-2`、`-3` 等后缀
    pub fn allocate(output_root: &Path) -> AppResult<Self> {
        let base = Self::new_run_id();
        let mut last_err = None;
        for n in 1..=MAX_ID_SUFFIX {
            let run_id = if n == 1 {
                base.clone()
            } else {
                format!("{}-{}", base, n)
            };
            match Self::create(output_root, &run_id) {
                Ok(ctx) => return Ok(ctx),
                // 只有运行目录本身已存在才换后缀重试
                Err(AppError::RunInit { path, reason }) if path == output_root.join(&run_id) && path.exists() => {
                    last_err = Some(AppError::RunInit { path, reason });
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| AppError::RunInit {
            path: output_root.join(&base),
            reason: "无法分配运行 id".to_string(),
        }))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root_path.join(MANIFEST_FILE)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn set_inputs(&mut self, inputs: ParamsSummary) {
        self.manifest.inputs = Some(inputs);
    }

    /// 运行目录内的路径
    ///
    /// 只接受相对路径，且不能包含 `..`。
    pub fn scoped_path(&self, relative: impl AsRef<Path>) -> AppResult<PathBuf> {
        let relative = relative.as_ref();
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(AppError::PathOutsideRun {
                path: relative.to_path_buf(),
                root: self.root_path.clone(),
            });
        }
        Ok(self.root_path.join(relative))
    }

    /// 确保运行目录内的子目录存在
    pub fn ensure_subdir(&self, name: &str) -> AppResult<PathBuf> {
        let dir = self.scoped_path(name)?;
        std::fs::create_dir_all(&dir).map_err(|e| AppError::file(&dir, e))?;
        Ok(dir)
    }

    /// 登记产物
    ///
    /// 路径必须位于运行目录之内，摘要中保存相对路径。
    pub fn record_artifact(&mut self, path: &Path) -> AppResult<PathBuf> {
        let relative = self.relative_to_root(path)?;
        if !self.manifest.artifact_paths.contains(&relative) {
            self.manifest.artifact_paths.push(relative.clone());
        }
        Ok(relative)
    }

    fn relative_to_root(&self, path: &Path) -> AppResult<PathBuf> {
        let outside = || AppError::PathOutsideRun {
            path: path.to_path_buf(),
            root: self.root_path.clone(),
        };
        let relative = if path.is_absolute() || path.starts_with(&self.root_path) {
            path.strip_prefix(&self.root_path).map_err(|_| outside())?
        } else {
            path
        };
        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(outside());
        }
        Ok(relative.to_path_buf())
    }

    pub fn record_stage_timing(&mut self, name: &str, duration: Duration) {
        self.manifest.stage_timings.push(StageTiming {
            stage: name.to_string(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        });
    }

    pub fn record_counts(&mut self, name: &str, produced: usize, failed: usize) {
        self.manifest.item_counts.push(StageCounts {
            stage: name.to_string(),
            produced,
            failed,
        });
    }

    /// 写入运行摘要
    ///
    /// 第一次成功写入后再次调用直接返回，不会改写已落盘的终态。
    pub fn finalize(&mut self, status: RunStatus, error: Option<String>) -> AppResult<PathBuf> {
        let path = self.manifest_path();
        if self.finalized {
            return Ok(path);
        }

        self.manifest.status = status;
        self.manifest.error = error;
        self.manifest.finished_at = Some(Local::now());

        let json = serde_json::to_vec_pretty(&self.manifest)?;
        std::fs::write(&path, json).map_err(|e| AppError::file(&path, e))?;
        self.finalized = true;

        info!("[运行 {}] 📝 运行摘要已写入: {}", self.run_id, path.display());
        Ok(path)
    }
}
