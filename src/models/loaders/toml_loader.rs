use std::path::Path;

use tokio::fs;

use crate::error::{AppError, AppResult};
use crate::models::PipelineParams;

/// 从 TOML 文件加载运行参数
pub async fn load_params(toml_file_path: &Path) -> AppResult<PipelineParams> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .map_err(|e| AppError::file(toml_file_path, e))?;

    let params: PipelineParams = toml::from_str(&content)?;

    tracing::info!(
        "已加载运行参数: {} ({} 个设备)",
        toml_file_path.display(),
        params.device_list().len()
    );

    Ok(params)
}
