use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{Barrier, Notify, Semaphore};

use traffic_graph_ocr::models::TextRegion;
use traffic_graph_ocr::services::run_catalog;
use traffic_graph_ocr::services::ScrapeRequest;
use traffic_graph_ocr::{
    AppError, CollaboratorError, Config, GraphScraper, PipelineOrchestrator, PipelineParams,
    ProgressStatus, ProgressTracker, RecognitionError, Recognizer, RunStatus, TargetUnit,
};

/// 内存中的采集器：写一个假的 PNG，按设备名决定成败
#[derive(Default)]
struct FakeScraper {
    failing: HashSet<String>,
    /// 每次采集前需要拿到一个许可
    gate: Option<Arc<Semaphore>>,
    started: Arc<Notify>,
    captured: AtomicUsize,
}

impl FakeScraper {
    fn failing(devices: &[&str]) -> Self {
        Self {
            failing: devices.iter().map(|d| d.to_string()).collect(),
            ..Self::default()
        }
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }
}

impl GraphScraper for FakeScraper {
    fn open_session<'a>(&'a self, _request: &'a ScrapeRequest) -> BoxFuture<'a, Result<(), CollaboratorError>> {
        async { Ok(()) }.boxed()
    }

    fn capture_graph<'a>(
        &'a self,
        device: &'a str,
        images_dir: &'a Path,
        _diagnostics_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, CollaboratorError>> {
        async move {
            self.started.notify_one();
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.map_err(|e| CollaboratorError::Fatal(e.to_string()))?;
            }
            self.captured.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(device) {
                return Err(CollaboratorError::NoData(format!("{} 没有图表", device)));
            }
            let path = images_dir.join(format!("{}.png", device));
            std::fs::write(&path, b"\x89PNG fake").map_err(|e| CollaboratorError::Fatal(e.to_string()))?;
            Ok(path)
        }
        .boxed()
    }

    fn close_session(&self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }
}

/// 返回固定文字的识别器；文件名含 `blank` 的图片识别不出流量区块
struct FakeRecognizer;

impl Recognizer for FakeRecognizer {
    fn recognize<'a>(&'a self, image: &'a Path) -> BoxFuture<'a, Result<Vec<TextRegion>, RecognitionError>> {
        async move {
            let name = image.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let lines: &[&str] = if name.contains("blank") {
                &["No data sources present"]
            } else {
                &[
                    "isp-cust-pre ACME NET / 1562-3523053600",
                    "From 2025-03-01 00:00 To 2025-03-31 23:59",
                    "Inbound Current: 100 Kbps Average: 50.5 M Maximum: 2.5 Mbps",
                    "Outbound Current: 740 Average: 1200 Maximum: 100",
                ]
            };
            Ok(lines
                .iter()
                .map(|t| TextRegion {
                    text: t.to_string(),
                    bounds: None,
                })
                .collect())
        }
        .boxed()
    }
}

fn test_config(output_root: &Path) -> Config {
    Config {
        output_root: output_root.display().to_string(),
        log_dir: None,
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
        ocr_workers: 3,
        stage_max_failure_rate: 0.5,
        ..Config::default()
    }
}

fn params(devices: &[&str]) -> PipelineParams {
    PipelineParams {
        target_url: "http://cacti.test/graph_view.php".to_string(),
        username: "operator".to_string(),
        password: "secret".to_string(),
        devices: devices.iter().map(|d| d.to_string()).collect(),
        date_from: "2025-03-01 00:00".to_string(),
        date_to: "2025-03-31 23:59".to_string(),
        output_units: TargetUnit::ALL.to_vec(),
    }
}

fn orchestrator(output_root: &Path, scraper: FakeScraper) -> (PipelineOrchestrator, Arc<ProgressTracker>) {
    let tracker = Arc::new(ProgressTracker::new());
    let orchestrator = PipelineOrchestrator::with_tracker(
        test_config(output_root),
        Arc::new(scraper),
        Arc::new(FakeRecognizer),
        tracker.clone(),
    );
    (orchestrator, tracker)
}

fn csv_rows(path: &Path) -> usize {
    std::fs::read_to_string(path).unwrap().lines().count() - 1
}

#[tokio::test]
async fn test_happy_path_produces_csvs_and_manifest() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, tracker) = orchestrator(dir.path(), FakeScraper::default());

    let outcome = orchestrator.run(params(&["sw-01", "sw-02", "sw-03"])).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.error.is_none());

    for unit in TargetUnit::ALL {
        let csv = outcome
            .root_path
            .join(format!("traffic_{}_{}.csv", unit.file_tag(), outcome.run_id));
        assert!(csv.is_file(), "缺少 {}", csv.display());
        assert_eq!(csv_rows(&csv), 3);
    }
    assert!(outcome.root_path.join("processed_output/recognized.json").is_file());
    assert!(outcome.root_path.join("processed_output/normalized.json").is_file());

    let manifest = run_catalog::load_manifest(&outcome.root_path).unwrap();
    assert_eq!(manifest.status, RunStatus::Completed);
    assert!(manifest.finished_at.is_some());
    assert_eq!(manifest.stage_timings.len(), 3);
    assert_eq!(manifest.counts_for("scrape").unwrap().produced, 3);
    assert_eq!(manifest.counts_for("clean").unwrap().produced, 3);
    assert!(manifest.artifact_paths.iter().all(|p| p.is_relative()));
    // 三个结果表加上 processed_output/ocr_raw.csv
    assert_eq!(run_catalog::csv_artifacts(&outcome.root_path).unwrap().len(), 4);
    // 密码不写入运行摘要
    let raw = std::fs::read_to_string(outcome.manifest_path.unwrap()).unwrap();
    assert!(!raw.contains("secret"));

    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.status, ProgressStatus::Completed);
    assert_eq!(snapshot.percent, 100);
    assert!(orchestrator.active_run_id().is_none());
}

#[tokio::test]
async fn test_sub_item_failures_below_threshold_are_absorbed() {
    let dir = tempfile::tempdir().unwrap();
    let devices: Vec<String> = (0..10).map(|i| format!("dev-{:02}", i)).collect();
    let device_refs: Vec<&str> = devices.iter().map(String::as_str).collect();
    let scraper = FakeScraper::failing(&["dev-01", "dev-04", "dev-07"]);
    let (orchestrator, _tracker) = orchestrator(dir.path(), scraper);

    let outcome = orchestrator.run(params(&device_refs)).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);

    let manifest = run_catalog::load_manifest(&outcome.root_path).unwrap();
    let scrape = manifest.counts_for("scrape").unwrap();
    assert_eq!((scrape.produced, scrape.failed), (7, 3));
    assert_eq!(manifest.counts_for("recognize").unwrap().produced, 7);

    let original = outcome
        .root_path
        .join(format!("traffic_original_{}.csv", outcome.run_id));
    assert_eq!(csv_rows(&original), 7);
}

#[tokio::test]
async fn test_recognition_failure_counts_as_failed_item() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _tracker) = orchestrator(dir.path(), FakeScraper::default());

    let outcome = orchestrator
        .run(params(&["sw-01", "sw-blank", "sw-03"]))
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);

    let manifest = run_catalog::load_manifest(&outcome.root_path).unwrap();
    let recognize = manifest.counts_for("recognize").unwrap();
    assert_eq!((recognize.produced, recognize.failed), (2, 1));
    let clean = manifest.counts_for("clean").unwrap();
    assert_eq!((clean.produced, clean.failed), (2, 1));

    // 原始识别表保留全部图片
    let raw = outcome.root_path.join("processed_output/ocr_raw.csv");
    assert_eq!(csv_rows(&raw), 3);
}

#[tokio::test]
async fn test_threshold_exceeded_fails_run_and_keeps_partial_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let scraper = FakeScraper::failing(&["b", "c", "d"]);
    let (orchestrator, tracker) = orchestrator(dir.path(), scraper);

    let outcome = orchestrator.run(params(&["a", "b", "c", "d"])).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.error.as_deref().unwrap().contains("scrape"));

    let manifest = run_catalog::load_manifest(&outcome.root_path).unwrap();
    assert_eq!(manifest.status, RunStatus::Failed);
    let scrape = manifest.counts_for("scrape").unwrap();
    assert_eq!((scrape.produced, scrape.failed), (1, 3));
    assert!(manifest.counts_for("recognize").is_none());
    assert!(outcome.root_path.join("raw_screenshots/a.png").is_file());
    assert!(outcome.root_path.join("scrape_report.json").is_file());
    assert!(manifest
        .artifact_paths
        .contains(&PathBuf::from("raw_screenshots").join("a.png")));

    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.status, ProgressStatus::Failed);
    assert_eq!(snapshot.current_stage.as_deref(), Some("scrape"));

    // 运行锁已释放
    let second = orchestrator.run(params(&["a"])).await.unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_ne!(second.run_id, outcome.run_id);
}

#[tokio::test]
async fn test_concurrent_start_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let (orchestrator, tracker) = orchestrator(dir.path(), FakeScraper::gated(gate.clone()));

    let ticket = orchestrator.start(params(&["sw-01", "sw-02"])).unwrap();
    assert_eq!(orchestrator.active_run_id().as_deref(), Some(ticket.run_id.as_str()));
    assert_eq!(tracker.snapshot().status, ProgressStatus::Running);

    let err = orchestrator.start(params(&["sw-03"])).err().unwrap();
    match err {
        AppError::AlreadyRunning { run_id } => assert_eq!(run_id.as_deref(), Some(ticket.run_id.as_str())),
        other => panic!("意外的错误: {}", other),
    }
    assert!(matches!(
        orchestrator.run(params(&["sw-03"])).await,
        Err(AppError::AlreadyRunning { .. })
    ));
    // 被拒绝的请求不创建运行目录
    assert_eq!(run_catalog::list_runs(dir.path()).unwrap().len(), 1);

    gate.add_permits(16);
    let outcome = ticket.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);

    let again = orchestrator.run(params(&["sw-03"])).await.unwrap();
    assert!(again.is_success());
}

#[tokio::test]
async fn test_cancel_stops_between_items_and_releases_lock() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let scraper = FakeScraper::gated(gate.clone());
    let started = scraper.started.clone();
    let (orchestrator, tracker) = orchestrator(dir.path(), scraper);

    let ticket = orchestrator.start(params(&["sw-01", "sw-02", "sw-03"])).unwrap();
    started.notified().await;
    assert!(orchestrator.cancel());
    gate.add_permits(16);

    let outcome = ticket.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Cancelled);

    let manifest = run_catalog::load_manifest(&outcome.root_path).unwrap();
    assert_eq!(manifest.status, RunStatus::Cancelled);
    let scrape = manifest.counts_for("scrape").unwrap();
    assert_eq!(scrape.produced, 1);
    assert_eq!(tracker.snapshot().status, ProgressStatus::Failed);

    assert!(!orchestrator.cancel());
    assert!(orchestrator.active_run_id().is_none());
    let again = orchestrator.run(params(&["sw-04"])).await.unwrap();
    assert!(again.is_success());
}

#[tokio::test]
async fn test_invalid_params_rejected_before_run_dir() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, tracker) = orchestrator(dir.path(), FakeScraper::default());

    let mut bad_url = params(&["sw-01"]);
    bad_url.target_url = "ftp://cacti.test/".to_string();
    assert!(matches!(
        orchestrator.run(bad_url).await,
        Err(AppError::InvalidParams(_))
    ));

    assert!(matches!(
        orchestrator.run(params(&["  "])).await,
        Err(AppError::InvalidParams(_))
    ));

    assert!(run_catalog::list_runs(dir.path()).unwrap().is_empty());
    assert_eq!(tracker.snapshot().status, ProgressStatus::Idle);
}

#[tokio::test]
async fn test_dropped_inline_run_still_finalizes() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let (orchestrator, tracker) = orchestrator(dir.path(), FakeScraper::gated(gate.clone()));

    let dropped = tokio::time::timeout(
        Duration::from_millis(50),
        orchestrator.run(params(&["sw-01", "sw-02"])),
    )
    .await;
    assert!(dropped.is_err());
    let first_id = tracker.snapshot().run_id.unwrap();

    gate.add_permits(16);
    let mut second = None;
    for _ in 0..250 {
        match orchestrator.run(params(&["sw-03"])).await {
            Err(AppError::AlreadyRunning { .. }) => tokio::time::sleep(Duration::from_millis(20)).await,
            other => {
                second = Some(other.unwrap());
                break;
            }
        }
    }
    let second = second.expect("被丢弃的运行没有释放运行锁");
    assert!(second.is_success());
    assert_ne!(second.run_id, first_id);

    let manifest = run_catalog::load_manifest(&dir.path().join(&first_id)).unwrap();
    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(manifest.counts_for("scrape").unwrap().produced, 2);
}

#[tokio::test]
async fn test_recognize_threshold_exceeded_keeps_partial_results() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, tracker) = orchestrator(dir.path(), FakeScraper::default());

    let outcome = orchestrator
        .run(params(&["sw-01", "sw-blank-1", "sw-blank-2"]))
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.error.as_deref().unwrap().contains("recognize"));

    let manifest = run_catalog::load_manifest(&outcome.root_path).unwrap();
    assert_eq!(manifest.counts_for("scrape").unwrap().produced, 3);
    assert_eq!(manifest.counts_for("recognize").unwrap().failed, 2);
    assert!(manifest.counts_for("clean").is_none());

    let recognized = outcome.root_path.join("processed_output/recognized.json");
    let records: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&recognized).unwrap()).unwrap();
    assert!(records.len() >= 2);
    assert!(manifest
        .artifact_paths
        .contains(&PathBuf::from("processed_output").join("recognized.json")));
    assert!(run_catalog::csv_artifacts(&outcome.root_path)
        .unwrap()
        .iter()
        .all(|p| !p.file_name().unwrap().to_string_lossy().starts_with("traffic_")));

    assert_eq!(tracker.snapshot().status, ProgressStatus::Failed);
}

#[tokio::test]
async fn test_unwritable_output_root_reports_run_init_failure() {
    let dir = tempfile::tempdir().unwrap();
    let file_root = dir.path().join("output");
    std::fs::write(&file_root, "x").unwrap();
    let (orchestrator, tracker) = orchestrator(&file_root, FakeScraper::default());

    for _ in 0..2 {
        assert!(matches!(
            orchestrator.run(params(&["sw-01"])).await,
            Err(AppError::RunInit { .. })
        ));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.status, ProgressStatus::Failed);
        assert!(snapshot.run_id.is_none());
        assert!(orchestrator.active_run_id().is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_starts_admit_exactly_one() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let (orchestrator, _tracker) = orchestrator(dir.path(), FakeScraper::gated(gate.clone()));

    let contenders = 8;
    let barrier = Arc::new(Barrier::new(contenders));
    let mut handles = Vec::new();
    for i in 0..contenders {
        let orchestrator = orchestrator.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            let device = format!("sw-{:02}", i);
            barrier.wait().await;
            orchestrator.start(params(&[device.as_str()]))
        }));
    }

    let mut tickets = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(ticket) => tickets.push(ticket),
            Err(AppError::AlreadyRunning { .. }) => rejected += 1,
            Err(other) => panic!("意外的错误: {}", other),
        }
    }
    assert_eq!(tickets.len(), 1);
    assert_eq!(rejected, contenders - 1);
    assert_eq!(run_catalog::list_runs(dir.path()).unwrap().len(), 1);

    gate.add_permits(16);
    let outcome = tickets.pop().unwrap().wait().await.unwrap();
    assert!(outcome.is_success());
}
