use serde::{Deserialize, Serialize};

use super::units::TargetUnit;
use crate::config::mask_sensitive;

/// 一次流水线运行的输入参数
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineParams {
    /// 监控平台地址
    pub target_url: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// 需要采集的设备（图表过滤关键字）
    pub devices: Vec<String>,
    /// 起始时间，格式同页面日期框，例如 `2025-03-01 00:00`
    pub date_from: String,
    pub date_to: String,
    #[serde(default = "default_output_units")]
    pub output_units: Vec<TargetUnit>,
}

fn default_output_units() -> Vec<TargetUnit> {
    TargetUnit::ALL.to_vec()
}

impl PipelineParams {
    /// 参数自检，不涉及网络
    pub fn validate(&self) -> Result<(), String> {
        if self.devices.iter().all(|d| d.trim().is_empty()) {
            return Err("设备列表为空".to_string());
        }
        if self.username.trim().is_empty() {
            return Err("用户名为空".to_string());
        }
        if self.date_from.trim().is_empty() || self.date_to.trim().is_empty() {
            return Err("时间范围不完整".to_string());
        }
        if self.output_units.is_empty() {
            return Err("未选择任何输出单位".to_string());
        }
        Ok(())
    }

    /// 去除空白项后的设备列表
    pub fn device_list(&self) -> Vec<String> {
        self.devices
            .iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect()
    }

    /// 写入运行摘要的参数副本（不含密码）
    pub fn summary(&self) -> ParamsSummary {
        ParamsSummary {
            target_url: self.target_url.clone(),
            username: mask_sensitive(&self.username),
            devices: self.device_list(),
            date_from: self.date_from.clone(),
            date_to: self.date_to.clone(),
            output_units: self.output_units.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamsSummary {
    pub target_url: String,
    pub username: String,
    pub devices: Vec<String>,
    pub date_from: String,
    pub date_to: String,
    pub output_units: Vec<TargetUnit>,
}
