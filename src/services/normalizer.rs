//! 数值归一化 - 业务能力层
//!
//! ## 职责
//!
//! - 纠正识别文本（见 `text_correction`）
//! - 解析数值与单位，显式后缀优先，否则按量级推断
//! - 单位换算（以 1000 为底，精确缩放）与最终格式化
//!
//! 解析失败是数据而不是错误：返回 `(None, Unknown)`，永远不会变成 0。

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::{BandwidthUnit, RecognizedValue, TargetUnit};
use crate::services::text_correction::correct_text;

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid regex"));
static UNIT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:(k|m|g)(?:bps|b/s)?|(bps|b/s))(?:$|[^a-z])").expect("valid regex")
});

/// 没有单位后缀时的量级推断策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitHeuristic {
    pub threshold: f64,
    /// 数值小于阈值时采用的单位
    pub below: BandwidthUnit,
    /// 数值不小于阈值时采用的单位
    pub at_or_above: BandwidthUnit,
}

impl Default for UnitHeuristic {
    fn default() -> Self {
        Self {
            threshold: 1000.0,
            below: BandwidthUnit::Mbps,
            at_or_above: BandwidthUnit::Kbps,
        }
    }
}

impl UnitHeuristic {
    pub fn infer(&self, value: f64) -> BandwidthUnit {
        if value >= self.threshold {
            self.at_or_above
        } else {
            self.below
        }
    }
}

/// `parse_value` 的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedValue {
    pub numeric_value: Option<f64>,
    pub unit: BandwidthUnit,
    pub inferred: bool,
}

impl ParsedValue {
    const UNPARSED: ParsedValue = ParsedValue {
        numeric_value: None,
        unit: BandwidthUnit::Unknown,
        inferred: false,
    };
}

#[derive(Debug, Clone, Default)]
pub struct ValueNormalizer {
    heuristic: UnitHeuristic,
}

impl ValueNormalizer {
    pub fn new(heuristic: UnitHeuristic) -> Self {
        Self { heuristic }
    }

    pub fn heuristic(&self) -> &UnitHeuristic {
        &self.heuristic
    }

    pub fn correct_text(&self, raw: &str) -> String {
        correct_text(raw)
    }

    /// 解析纠正后的文本
    ///
    /// 取第一个数字；紧随其后的 K/M/G（可带 bps）为显式单位，
    /// 单独的 `bps` 换算为 Kbps；没有单位时按量级推断。
    pub fn parse_value(&self, corrected: &str) -> ParsedValue {
        let Some(m) = NUMBER.find(corrected) else {
            return ParsedValue::UNPARSED;
        };
        let rest = &corrected[m.end()..];

        // `1.2.3` 之类的残缺数字不猜测
        if rest.starts_with(['.', ',']) && rest[1..].starts_with(|c: char| c.is_ascii_digit()) {
            return ParsedValue::UNPARSED;
        }

        let value = match m.as_str().parse::<f64>() {
            Ok(v) if v.is_finite() => v,
            _ => return ParsedValue::UNPARSED,
        };

        if let Some(caps) = UNIT_SUFFIX.captures(rest) {
            if let Some(prefix) = caps.get(1) {
                let unit = prefix
                    .as_str()
                    .parse::<BandwidthUnit>()
                    .unwrap_or(BandwidthUnit::Unknown);
                return ParsedValue {
                    numeric_value: Some(value),
                    unit,
                    inferred: false,
                };
            }
            return ParsedValue {
                numeric_value: Some(value / 1000.0),
                unit: BandwidthUnit::Kbps,
                inferred: false,
            };
        }

        ParsedValue {
            numeric_value: Some(value),
            unit: self.heuristic.infer(value),
            inferred: true,
        }
    }

    /// 纠正 + 解析，生成 `RecognizedValue`
    pub fn recognize(&self, raw: &str, source_image: &Path) -> RecognizedValue {
        let corrected_text = self.correct_text(raw);
        let parsed = self.parse_value(&corrected_text);
        RecognizedValue {
            raw_text: raw.to_string(),
            corrected_text,
            numeric_value: parsed.numeric_value,
            unit: parsed.unit,
            unit_inferred: parsed.inferred,
            source_image: source_image.to_path_buf(),
        }
    }
}

/// 以 1000 为底的单位换算
///
/// 任一单位未知时返回 None。
pub fn convert(value: f64, from: BandwidthUnit, to: BandwidthUnit) -> Option<f64> {
    let diff = to.exponent()? - from.exponent()?;
    Some(match diff {
        0 => value,
        d if d > 0 => value / 1000f64.powi(d),
        d => value * 1000f64.powi(-d),
    })
}

/// 换算到输出目标单位
pub fn to_target(value: &RecognizedValue, target: TargetUnit) -> Option<f64> {
    let numeric = value.numeric_value?;
    match target.as_unit() {
        None => Some(numeric),
        Some(unit) => convert(numeric, value.unit, unit),
    }
}

/// 最终格式化：Mbps 保留两位小数，Kbps 取整，缺失写 `N/A`
pub fn format_value(value: Option<f64>, unit: BandwidthUnit) -> String {
    match (value, unit) {
        (None, _) | (_, BandwidthUnit::Unknown) => "N/A".to_string(),
        (Some(v), BandwidthUnit::Kbps) => format!("{} Kbps", v.round() as i64),
        (Some(v), BandwidthUnit::Mbps) => format!("{:.2} Mbps", v),
        (Some(v), BandwidthUnit::Gbps) => format!("{:.3} Gbps", v),
    }
}
