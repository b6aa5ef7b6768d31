use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 带宽单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BandwidthUnit {
    Kbps,
    Mbps,
    Gbps,
    #[serde(rename = "unknown")]
    Unknown,
}

impl BandwidthUnit {
    /// 相对 Kbps 的 1000 次幂，未知单位没有量级
    pub fn exponent(self) -> Option<i32> {
        match self {
            BandwidthUnit::Kbps => Some(0),
            BandwidthUnit::Mbps => Some(1),
            BandwidthUnit::Gbps => Some(2),
            BandwidthUnit::Unknown => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BandwidthUnit::Kbps => "Kbps",
            BandwidthUnit::Mbps => "Mbps",
            BandwidthUnit::Gbps => "Gbps",
            BandwidthUnit::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BandwidthUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for BandwidthUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "k" | "kbps" => Ok(BandwidthUnit::Kbps),
            "m" | "mbps" => Ok(BandwidthUnit::Mbps),
            "g" | "gbps" => Ok(BandwidthUnit::Gbps),
            other => Err(format!("未知的带宽单位: {}", other)),
        }
    }
}

/// CSV 输出的目标单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetUnit {
    /// 保留识别出的原始单位
    Original,
    Mbps,
    Kbps,
}

impl TargetUnit {
    pub const ALL: [TargetUnit; 3] = [TargetUnit::Original, TargetUnit::Mbps, TargetUnit::Kbps];

    /// 输出文件名中的标记
    pub fn file_tag(self) -> &'static str {
        match self {
            TargetUnit::Original => "original",
            TargetUnit::Mbps => "mbps",
            TargetUnit::Kbps => "kbps",
        }
    }

    /// 需要换算到的单位；`Original` 不换算
    pub fn as_unit(self) -> Option<BandwidthUnit> {
        match self {
            TargetUnit::Original => None,
            TargetUnit::Mbps => Some(BandwidthUnit::Mbps),
            TargetUnit::Kbps => Some(BandwidthUnit::Kbps),
        }
    }
}

impl fmt::Display for TargetUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_tag())
    }
}
