//! 清洗阶段
//!
//! 读取识别结果，按调用方选择的输出单位生成 CSV（运行目录根下），
//! 同时写出逐指标的 `processed_output/normalized.json`。

use std::path::PathBuf;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::infrastructure::run_context::PROCESSED_OUTPUT_DIR;
use crate::infrastructure::RunContext;
use crate::models::{NormalizedRecord, PipelineParams, RecognizedValue, TargetUnit, TrafficRecord};
use crate::services::csv_writer::{converted_row, original_row, CsvTable, CONVERTED_COLUMNS, FULL_COLUMNS};
use crate::services::normalizer::to_target;
use crate::workflow::recognize_stage::RECOGNIZED_FILE;
use crate::workflow::stage::{Stage, StageEnv, StageKind, StageResult};

pub const NORMALIZED_FILE: &str = "normalized.json";

/// CSV 文件名：`traffic_<单位>_<run_id>.csv`
pub fn csv_file_name(unit: TargetUnit, run_id: &str) -> String {
    format!("traffic_{}_{}.csv", unit.file_tag(), run_id)
}

/// 去重并保持调用方给出的顺序；为空时输出全部
fn selected_units(params: &PipelineParams) -> Vec<TargetUnit> {
    let mut units: Vec<TargetUnit> = Vec::new();
    for unit in &params.output_units {
        if !units.contains(unit) {
            units.push(*unit);
        }
    }
    if units.is_empty() {
        units = TargetUnit::ALL.to_vec();
    }
    units
}

/// 一条识别记录展开为逐指标的清洗结果
fn normalize_record(record: &TrafficRecord, target: TargetUnit) -> Vec<NormalizedRecord> {
    let mut out = Vec::new();
    let directions = [("Inbound", record.inbound.as_ref()), ("Outbound", record.outbound.as_ref())];
    for (direction, reading) in directions {
        let Some(reading) = reading else { continue };
        let metrics: [(&str, Option<&RecognizedValue>); 3] = [
            ("Current", reading.current.as_ref()),
            ("Average", reading.average.as_ref()),
            ("Maximum", reading.maximum.as_ref()),
        ];
        for (name, value) in metrics {
            let Some(value) = value else { continue };
            out.push(NormalizedRecord {
                device_label: record.device_label.clone(),
                timestamp: record.period_to.clone(),
                metric: format!("{} {}", direction, name),
                value_in_target_unit: to_target(value, target),
                target_unit: target,
                source_unit: value.unit,
                confidence_flag: value.unit_inferred,
            });
        }
    }
    out
}

pub struct CleanStage;

impl CleanStage {
    pub fn new() -> Self {
        Self
    }

    fn load_records(ctx: &RunContext) -> AppResult<Vec<TrafficRecord>> {
        let path = ctx.scoped_path(PathBuf::from(PROCESSED_OUTPUT_DIR).join(RECOGNIZED_FILE))?;
        if !path.is_file() {
            warn!("⚠️ 未找到识别结果: {}", path.display());
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| AppError::file(&path, e))?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl Default for CleanStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for CleanStage {
    fn kind(&self) -> StageKind {
        StageKind::Clean
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut RunContext,
        params: &'a PipelineParams,
        env: &'a StageEnv,
    ) -> BoxFuture<'a, AppResult<StageResult>> {
        async move {
            let kind = self.kind();
            env.check_cancelled(kind, 0, 0)?;

            let records = Self::load_records(ctx)?;
            let units = selected_units(params);
            let total = records.len();
            env.report(kind, 0, total, format!("开始清洗 {} 条记录", total));

            let mut tables: Vec<(TargetUnit, CsvTable)> = units
                .iter()
                .map(|unit| {
                    let table = match unit {
                        TargetUnit::Original => CsvTable::new(&FULL_COLUMNS),
                        _ => CsvTable::new(&CONVERTED_COLUMNS),
                    };
                    (*unit, table)
                })
                .collect();
            let mut normalized: Vec<NormalizedRecord> = Vec::new();
            let (mut produced, mut failed) = (0usize, 0usize);

            for (index, record) in records.iter().enumerate() {
                env.check_cancelled(kind, produced, failed)?;

                if record.is_usable() {
                    for (unit, table) in tables.iter_mut() {
                        let row = match unit {
                            TargetUnit::Original => original_row(record),
                            _ => converted_row(record, *unit),
                        };
                        table.push_row(row);
                        normalized.extend(normalize_record(record, *unit));
                    }
                    produced += 1;
                } else {
                    warn!(
                        "[设备 {}] ⚠️ 跳过无效记录: {}",
                        record.device_label,
                        record.error.as_deref().unwrap_or("未知错误")
                    );
                    failed += 1;
                }

                env.report(
                    kind,
                    index + 1,
                    total,
                    format!("已清洗 {}/{} (失败 {})", index + 1, total, failed),
                );
                env.policy.check(kind, produced, failed, total)?;
            }

            let mut artifacts = Vec::with_capacity(tables.len() + 1);
            for (unit, table) in &tables {
                let path = ctx.scoped_path(csv_file_name(*unit, ctx.run_id()))?;
                table.write_to(&path)?;
                info!("📄 已生成 {} ({} 行)", path.display(), table.len());
                artifacts.push(ctx.record_artifact(&path)?);
            }

            let out_dir = ctx.ensure_subdir(PROCESSED_OUTPUT_DIR)?;
            let json_path = out_dir.join(NORMALIZED_FILE);
            let json = serde_json::to_vec_pretty(&normalized)?;
            std::fs::write(&json_path, json).map_err(|e| AppError::file(&json_path, e))?;
            artifacts.push(ctx.record_artifact(&json_path)?);

            Ok(StageResult {
                produced_count: produced,
                failed_count: failed,
                artifacts,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::ProgressTracker;
    use crate::models::{BandwidthUnit, TrafficReading};
    use crate::services::normalizer::ValueNormalizer;
    use crate::workflow::FailurePolicy;
    use std::path::Path;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn params(units: Vec<TargetUnit>) -> PipelineParams {
        PipelineParams {
            target_url: "http://cacti.local/".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            devices: vec!["sw-01".to_string()],
            date_from: "2025-03-01 00:00".to_string(),
            date_to: "2025-03-02 00:00".to_string(),
            output_units: units,
        }
    }

    fn record(normalizer: &ValueNormalizer) -> TrafficRecord {
        let image = Path::new("raw_screenshots/sw-01.png");
        TrafficRecord {
            device_label: "sw-01".to_string(),
            source_image: image.to_path_buf(),
            period_to: Some("2025/03/02 00:00:00".to_string()),
            inbound: Some(TrafficReading {
                current: None,
                average: Some(normalizer.recognize("250.5 Mbps", image)),
                maximum: Some(normalizer.recognize("1500", image)),
            }),
            ..TrafficRecord::default()
        }
    }

    #[test]
    fn test_selected_units_dedup_and_default() {
        let units = selected_units(&params(vec![TargetUnit::Kbps, TargetUnit::Kbps, TargetUnit::Mbps]));
        assert_eq!(units, vec![TargetUnit::Kbps, TargetUnit::Mbps]);
        assert_eq!(selected_units(&params(Vec::new())), TargetUnit::ALL.to_vec());
    }

    #[test]
    fn test_normalize_record_metrics() {
        let normalizer = ValueNormalizer::default();
        let rows = normalize_record(&record(&normalizer), TargetUnit::Kbps);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].metric, "Inbound Average");
        assert_eq!(rows[0].value_in_target_unit, Some(250_500.0));
        assert_eq!(rows[0].timestamp.as_deref(), Some("2025/03/02 00:00:00"));
        assert!(!rows[0].confidence_flag);

        // 1500 无单位：按量级推断为 Kbps
        assert_eq!(rows[1].source_unit, BandwidthUnit::Kbps);
        assert!(rows[1].confidence_flag);
    }

    #[test]
    fn test_csv_file_name() {
        assert_eq!(
            csv_file_name(TargetUnit::Mbps, "2025-03-01_10-00-00-000"),
            "traffic_mbps_2025-03-01_10-00-00-000.csv"
        );
    }

    #[tokio::test]
    async fn test_threshold_exceeded_writes_no_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = RunContext::create(dir.path(), "2025-03-01_10-00-00-000").unwrap();
        let normalizer = ValueNormalizer::default();
        let unusable = |label: &str| TrafficRecord {
            device_label: label.to_string(),
            error: Some("未找到 Inbound / Outbound 数据".to_string()),
            ..TrafficRecord::default()
        };
        let records = vec![record(&normalizer), unusable("sw-02"), unusable("sw-03")];
        let out_dir = ctx.ensure_subdir(PROCESSED_OUTPUT_DIR).unwrap();
        std::fs::write(out_dir.join(RECOGNIZED_FILE), serde_json::to_vec(&records).unwrap()).unwrap();

        let tracker = Arc::new(ProgressTracker::new());
        tracker.reset(ctx.run_id()).unwrap();
        let env = StageEnv::new(tracker, CancellationToken::new(), FailurePolicy::new(0.5));

        let err = CleanStage::new()
            .run(&mut ctx, &params(TargetUnit::ALL.to_vec()), &env)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StageFailureThresholdExceeded { .. }));
        assert_eq!(err.partial_counts(), Some((1, 2)));
        for unit in TargetUnit::ALL {
            assert!(!ctx.root_path().join(csv_file_name(unit, ctx.run_id())).exists());
        }
    }
}
