//! 流量图文本提取 - 业务能力层
//!
//! 从一张图表的识别文本中提取结构化字段：
//! ISP、VLAN / Service ID、统计周期，以及 Inbound / Outbound 的 Current / Average / Maximum。
//!
//! 数值片段取自原始识别文本（标签匹配容忍常见拼写错误），再交给 `ValueNormalizer`；
//! 其余字段取自纠正后的整段文本。

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::{TextRegion, TrafficReading, TrafficRecord};
use crate::services::normalizer::ValueNormalizer;

static INBOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b[il1]nbound\b").expect("valid regex"));
static OUTBOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:outbound|qutbound|qoutbound|cutbound|0utbound)\b").expect("valid regex")
});
static LABELED_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(cur\s*r?[ae]nt|average|avg|averge|maximum|marimum|maxinum|maxmum|max)\s*[:;]?\s*([0-9OoIl|][0-9OoIl|]*(?:\s*[.,]\s*[0-9OoIl|]+)?(?:\s*[kmg](?:bps|b/s)?\b|\s*bps\b)?)",
    )
    .expect("valid regex")
});
static VLAN_SERVICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{3,4})-(\d{10,})").expect("valid regex"));
static VLAN_DOTTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3,4}\.(\d{3,4})\b").expect("valid regex"));
static SERVICE_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-(\d{10,})").expect("valid regex"));
static ISP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)isp-cust(?:-pre)?\s*(.*?)\s*/").expect("valid regex"));
static PERIOD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)From\s*(.*?)\s*To\s*(.*?)\s*Inbound").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    Current,
    Average,
    Maximum,
}

impl Metric {
    fn from_label(label: &str) -> Self {
        let lower = label.to_ascii_lowercase();
        if lower.starts_with("cur") {
            Metric::Current
        } else if lower.starts_with("av") {
            Metric::Average
        } else {
            Metric::Maximum
        }
    }
}

/// 把识别区域拼成一段文本（按识别顺序，以空格分隔）
pub fn join_regions(regions: &[TextRegion]) -> String {
    regions
        .iter()
        .map(|r| r.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// 提取一张图表的结构化记录
///
/// 既没有 Inbound 也没有 Outbound 区块时，记录带有提取错误。
pub fn extract_record(
    device_label: &str,
    source_image: &Path,
    regions: &[TextRegion],
    normalizer: &ValueNormalizer,
) -> TrafficRecord {
    let raw_text = join_regions(regions);
    let corrected_text = normalizer.correct_text(&raw_text);

    let mut record = TrafficRecord {
        device_label: device_label.to_string(),
        source_image: source_image.to_path_buf(),
        raw_text: raw_text.clone(),
        corrected_text: corrected_text.clone(),
        ..TrafficRecord::default()
    };

    if let Some(caps) = VLAN_SERVICE.captures(&corrected_text) {
        record.vlan_id = Some(caps[1].to_string());
        record.service_id = Some(caps[2].to_string());
    } else if let Some(caps) = VLAN_DOTTED.captures(&corrected_text) {
        record.vlan_id = Some(caps[1].to_string());
    }
    if record.service_id.is_none() {
        record.service_id = SERVICE_ONLY
            .captures(&corrected_text)
            .map(|caps| caps[1].to_string());
    }
    record.isp = ISP
        .captures(&corrected_text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(caps) = PERIOD.captures(&corrected_text) {
        record.period_from = Some(caps[1].trim().to_string()).filter(|s| !s.is_empty());
        record.period_to = Some(caps[2].trim().to_string()).filter(|s| !s.is_empty());
    }

    let (inbound, outbound) = split_blocks(&raw_text);
    record.inbound = inbound.map(|block| read_block(block, source_image, normalizer));
    record.outbound = outbound.map(|block| read_block(block, source_image, normalizer));

    if record.inbound.is_none() && record.outbound.is_none() {
        record.error = Some("未找到 Inbound / Outbound 数据".to_string());
    }
    record
}

/// 按方向标签切分原始文本
fn split_blocks(text: &str) -> (Option<&str>, Option<&str>) {
    let inbound = INBOUND.find(text);
    let outbound = OUTBOUND.find(text);

    let block = |start: usize, other: Option<usize>| -> &str {
        match other {
            Some(next) if next > start => &text[start..next],
            _ => &text[start..],
        }
    };

    let inbound_block = inbound.map(|m| block(m.end(), outbound.map(|o| o.start())));
    let outbound_block = outbound.map(|m| block(m.end(), inbound.map(|i| i.start())));
    (inbound_block, outbound_block)
}

fn read_block(block: &str, source_image: &Path, normalizer: &ValueNormalizer) -> TrafficReading {
    let mut reading = TrafficReading::default();
    for caps in LABELED_VALUE.captures_iter(block) {
        let fragment = caps[2].trim();
        if !fragment.chars().any(|c| c.is_ascii_digit()) {
            continue;
        }
        let slot = match Metric::from_label(&caps[1]) {
            Metric::Current => &mut reading.current,
            Metric::Average => &mut reading.average,
            Metric::Maximum => &mut reading.maximum,
        };
        if slot.is_none() {
            *slot = Some(normalizer.recognize(fragment, source_image));
        }
    }
    reading
}
