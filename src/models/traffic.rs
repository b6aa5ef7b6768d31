//! 识别与清洗阶段的数据类型

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::units::{BandwidthUnit, TargetUnit};

/// 识别引擎返回的文字区域
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    pub text: String,
    #[serde(default)]
    pub bounds: Option<BoundingRegion>,
}

/// 文字区域在图片上的位置（像素）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// 单个识别数值
///
/// `numeric_value` 为 `None` 当且仅当解析失败，解析失败不会变成 0。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedValue {
    /// 识别引擎给出的原文片段
    pub raw_text: String,
    pub corrected_text: String,
    pub numeric_value: Option<f64>,
    pub unit: BandwidthUnit,
    /// 单位是按量级推断的，而不是图片上显式写出的
    pub unit_inferred: bool,
    pub source_image: PathBuf,
}

impl RecognizedValue {
    pub fn is_parsed(&self) -> bool {
        self.numeric_value.is_some()
    }
}

/// 一个方向（Inbound / Outbound）的三项读数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficReading {
    pub current: Option<RecognizedValue>,
    pub average: Option<RecognizedValue>,
    pub maximum: Option<RecognizedValue>,
}

impl TrafficReading {
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.average.is_none() && self.maximum.is_none()
    }
}

/// 一张图表图片的识别结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub device_label: String,
    pub source_image: PathBuf,
    pub isp: Option<String>,
    pub vlan_id: Option<String>,
    pub service_id: Option<String>,
    pub period_from: Option<String>,
    pub period_to: Option<String>,
    pub inbound: Option<TrafficReading>,
    pub outbound: Option<TrafficReading>,
    /// 拼接后的原始识别文本
    pub raw_text: String,
    pub corrected_text: String,
    /// 识别或提取失败的原因
    pub error: Option<String>,
}

impl TrafficRecord {
    pub fn is_usable(&self) -> bool {
        self.error.is_none()
    }
}

/// 清洗后的单条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub device_label: String,
    /// 图表周期的结束时间（识别文本）
    pub timestamp: Option<String>,
    /// 指标名，例如 `Inbound Average`
    pub metric: String,
    pub value_in_target_unit: Option<f64>,
    pub target_unit: TargetUnit,
    pub source_unit: BandwidthUnit,
    /// 单位是推断得出的
    pub confidence_flag: bool,
}
