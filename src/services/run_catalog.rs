//! 运行目录索引
//!
//! 下载端使用的只读视图：列出历史运行、找最新一次、读取运行摘要。

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::infrastructure::run_context::MANIFEST_FILE;
use crate::models::RunManifest;

#[derive(Debug, Clone, PartialEq)]
pub struct RunEntry {
    pub run_id: String,
    pub root_path: PathBuf,
    pub has_manifest: bool,
}

/// 基础运行 id（`%Y-%m-%d_%H-%M-%S-%3f`）中 `-` 的个数
const BASE_ID_DASHES: usize = 5;

/// 排序键：(时间戳部分, 冲突后缀)，没有后缀的视为 1
///
/// 后缀按数值比较，`-10` 排在 `-2` 之后。
fn run_order_key(run_id: &str) -> (&str, u32) {
    if run_id.matches('-').count() > BASE_ID_DASHES {
        if let Some((base, suffix)) = run_id.rsplit_once('-') {
            if let Ok(n) = suffix.parse() {
                return (base, n);
            }
        }
    }
    (run_id, 1)
}

/// 列出输出目录下的所有运行，最新的在前
///
/// 运行 id 以时间戳开头，同一毫秒内的冲突后缀按数值排序。输出目录不存在时返回空列表。
pub fn list_runs(output_root: &Path) -> AppResult<Vec<RunEntry>> {
    let entries = match std::fs::read_dir(output_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AppError::file(output_root, e)),
    };

    let mut runs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| AppError::file(output_root, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(run_id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        runs.push(RunEntry {
            has_manifest: path.join(MANIFEST_FILE).is_file(),
            run_id,
            root_path: path,
        });
    }
    runs.sort_by(|a, b| run_order_key(&b.run_id).cmp(&run_order_key(&a.run_id)));
    Ok(runs)
}

/// 最近一次运行
pub fn latest_run(output_root: &Path) -> AppResult<Option<RunEntry>> {
    Ok(list_runs(output_root)?.into_iter().next())
}

/// 读取运行摘要
pub fn load_manifest(run_root: &Path) -> AppResult<RunManifest> {
    let path = run_root.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&path).map_err(|e| AppError::file(&path, e))?;
    Ok(serde_json::from_str(&content)?)
}

/// 运行及其摘要
#[derive(Debug, Clone)]
pub struct RunListing {
    pub entry: RunEntry,
    /// 摘要缺失或无法读取时为 None
    pub manifest: Option<RunManifest>,
    /// 摘要无法读取的原因
    pub problem: Option<String>,
}

/// 列出所有运行并读取各自的摘要
///
/// 单个摘要损坏只记录告警，不影响其它运行的列出。
pub fn list_runs_with_manifests(output_root: &Path) -> AppResult<Vec<RunListing>> {
    Ok(list_runs(output_root)?
        .into_iter()
        .map(|entry| {
            if !entry.has_manifest {
                return RunListing {
                    entry,
                    manifest: None,
                    problem: None,
                };
            }
            match load_manifest(&entry.root_path) {
                Ok(manifest) => RunListing {
                    entry,
                    manifest: Some(manifest),
                    problem: None,
                },
                Err(e) => {
                    warn!("⚠️ 运行 {} 的摘要无法读取: {}", entry.run_id, e);
                    RunListing {
                        entry,
                        manifest: None,
                        problem: Some(e.to_string()),
                    }
                }
            }
        })
        .collect())
}

/// 一次运行产出的 CSV 文件（绝对路径）
pub fn csv_artifacts(run_root: &Path) -> AppResult<Vec<PathBuf>> {
    let manifest = load_manifest(run_root)?;
    Ok(manifest
        .artifacts_with_extension("csv")
        .map(|p| run_root.join(p))
        .collect())
}
