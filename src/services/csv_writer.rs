//! CSV 输出 - 业务能力层
//!
//! 负责两类表格：识别阶段的原始表、清洗阶段按单位生成的结果表。

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{AppError, AppResult};
use crate::models::{RecognizedValue, TargetUnit, TrafficReading, TrafficRecord};
use crate::services::normalizer::{format_value, to_target};

pub const FULL_COLUMNS: [&str; 12] = [
    "ID",
    "ISP",
    "VLAN ID",
    "Service ID",
    "Inbound Current",
    "Inbound Average",
    "Inbound Max",
    "Outbound Current",
    "Outbound Average",
    "Outbound Max",
    "Period From",
    "Period To",
];

/// 换算后的表格去掉标识列和 Current 列，加上推断标记
pub const CONVERTED_COLUMNS: [&str; 8] = [
    "ID",
    "Inbound Average",
    "Inbound Max",
    "Outbound Average",
    "Outbound Max",
    "Period From",
    "Period To",
    "Unit Inferred",
];

#[derive(Debug, Clone, Default)]
pub struct CsvTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl CsvTable {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn write_to(&self, path: &Path) -> AppResult<()> {
        let file = File::create(path).map_err(|e| AppError::file(path, e))?;
        let mut writer = BufWriter::new(file);
        self.write(&mut writer).map_err(|e| AppError::file(path, e))?;
        writer.flush().map_err(|e| AppError::file(path, e))
    }

    fn write<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        write_line(out, &self.headers)?;
        for row in &self.rows {
            write_line(out, row)?;
        }
        Ok(())
    }

    pub fn to_csv_string(&self) -> String {
        let mut buf = Vec::new();
        // 写入内存不会失败
        let _ = self.write(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn write_line<W: Write>(out: &mut W, fields: &[String]) -> std::io::Result<()> {
    let line = fields.iter().map(|f| escape(f)).collect::<Vec<_>>().join(",");
    out.write_all(line.as_bytes())?;
    out.write_all(b"\r\n")
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

// ========== 行构造 ==========

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn reading_field(
    reading: Option<&TrafficReading>,
    pick: fn(&TrafficReading) -> Option<&RecognizedValue>,
) -> Option<&RecognizedValue> {
    reading.and_then(pick)
}

fn current(r: &TrafficReading) -> Option<&RecognizedValue> {
    r.current.as_ref()
}

fn average(r: &TrafficReading) -> Option<&RecognizedValue> {
    r.average.as_ref()
}

fn maximum(r: &TrafficReading) -> Option<&RecognizedValue> {
    r.maximum.as_ref()
}

/// 原始识别表：数值列保留识别片段原文
pub fn raw_row(record: &TrafficRecord) -> Vec<String> {
    let raw = |v: Option<&RecognizedValue>| v.map(|v| v.raw_text.clone()).unwrap_or_default();
    full_row(record, raw)
}

/// 原始单位结果表：数值列为纠正后的文本，解析失败写 `N/A`
pub fn original_row(record: &TrafficRecord) -> Vec<String> {
    let corrected = |v: Option<&RecognizedValue>| match v {
        Some(v) if v.is_parsed() => v.corrected_text.clone(),
        Some(_) => "N/A".to_string(),
        None => String::new(),
    };
    full_row(record, corrected)
}

fn full_row(record: &TrafficRecord, cell: impl Fn(Option<&RecognizedValue>) -> String) -> Vec<String> {
    let inbound = record.inbound.as_ref();
    let outbound = record.outbound.as_ref();
    vec![
        record.device_label.clone(),
        opt(&record.isp),
        opt(&record.vlan_id),
        opt(&record.service_id),
        cell(reading_field(inbound, current)),
        cell(reading_field(inbound, average)),
        cell(reading_field(inbound, maximum)),
        cell(reading_field(outbound, current)),
        cell(reading_field(outbound, average)),
        cell(reading_field(outbound, maximum)),
        opt(&record.period_from),
        opt(&record.period_to),
    ]
}

/// 换算表的一行
pub fn converted_row(record: &TrafficRecord, target: TargetUnit) -> Vec<String> {
    let inbound = record.inbound.as_ref();
    let outbound = record.outbound.as_ref();
    let values = [
        reading_field(inbound, average),
        reading_field(inbound, maximum),
        reading_field(outbound, average),
        reading_field(outbound, maximum),
    ];
    let inferred = values.iter().flatten().any(|v| v.unit_inferred);

    let mut row = vec![record.device_label.clone()];
    for value in values {
        row.push(match (value, target.as_unit()) {
            (None, _) => String::new(),
            (Some(v), Some(unit)) => format_value(to_target(v, target), unit),
            (Some(v), None) => format_value(v.numeric_value, v.unit),
        });
    }
    row.push(opt(&record.period_from));
    row.push(opt(&record.period_to));
    row.push(if inferred { "yes" } else { "no" }.to_string());
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BandwidthUnit;
    use std::path::PathBuf;

    fn value(raw: &str, numeric: Option<f64>, unit: BandwidthUnit, inferred: bool) -> RecognizedValue {
        RecognizedValue {
            raw_text: raw.to_string(),
            corrected_text: raw.to_string(),
            numeric_value: numeric,
            unit,
            unit_inferred: inferred,
            source_image: PathBuf::from("a.png"),
        }
    }

    fn record() -> TrafficRecord {
        TrafficRecord {
            device_label: "1562-3523053600".into(),
            isp: Some("ACME, Inc".into()),
            inbound: Some(TrafficReading {
                current: Some(value("100 Kbps", Some(100.0), BandwidthUnit::Kbps, false)),
                average: Some(value("1500", Some(1500.0), BandwidthUnit::Kbps, true)),
                maximum: Some(value("2.5 M", Some(2.5), BandwidthUnit::Mbps, false)),
            }),
            outbound: Some(TrafficReading {
                current: None,
                average: Some(value("lOO", None, BandwidthUnit::Unknown, false)),
                maximum: None,
            }),
            period_from: Some("2025-03-01 00:00".into()),
            period_to: Some("2025-03-31 23:59".into()),
            ..TrafficRecord::default()
        }
    }

    #[test]
    fn test_converted_row_formats_and_marks_inferred() {
        let row = converted_row(&record(), TargetUnit::Mbps);
        assert_eq!(row.len(), CONVERTED_COLUMNS.len());
        assert_eq!(row[1], "1.50 Mbps");
        assert_eq!(row[2], "2.50 Mbps");
        assert_eq!(row[3], "N/A");
        assert_eq!(row[4], "");
        assert_eq!(row[7], "yes");

        let row = converted_row(&record(), TargetUnit::Kbps);
        assert_eq!(row[2], "2500 Kbps");
    }

    #[test]
    fn test_original_row_never_writes_zero_for_failures() {
        let row = original_row(&record());
        assert_eq!(row.len(), FULL_COLUMNS.len());
        assert_eq!(row[4], "100 Kbps");
        assert_eq!(row[8], "N/A");
    }

    #[test]
    fn test_csv_quoting() {
        let mut table = CsvTable::new(&FULL_COLUMNS);
        table.push_row(raw_row(&record()));
        let csv = table.to_csv_string();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("ID,ISP,VLAN ID"));
        assert!(lines.next().unwrap().starts_with("1562-3523053600,\"ACME, Inc\","));
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
