use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio_test::assert_ok;

use doc_tracer::config::Config;
use doc_tracer::error::{PipelineError, PipelineResult};
use doc_tracer::infrastructure::RunStore;
use doc_tracer::models::{AggregatedTables, RunMetadata, RunStatus, Stage};
use doc_tracer::orchestrator::{RunOptions, RunOrchestrator};
use doc_tracer::services::{DocumentSplitter, ExtractionService, MergePolicy, MockExtractor};

const PIPELINE: &str = "invoices";

/// 把任意输入拆成固定页数的文本文件
struct FixedPageSplitter {
    pages: usize,
}

impl DocumentSplitter for FixedPageSplitter {
    fn split(&self, _input: &Path, pages_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        std::fs::create_dir_all(pages_dir).map_err(|e| PipelineError::io(pages_dir, e))?;
        (1..=self.pages)
            .map(|n| {
                let path = pages_dir.join(format!("page_{}.txt", n));
                std::fs::write(&path, format!("page {}", n))
                    .map_err(|e| PipelineError::io(&path, e))?;
                Ok(path)
            })
            .collect()
    }
}

fn page_number(page_path: &Path) -> usize {
    page_path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("page_"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// 每页返回一张 `Invoice` 表，指定的页返回服务错误
struct ScriptedExtractor {
    failing_pages: Vec<usize>,
}

#[async_trait]
impl ExtractionService for ScriptedExtractor {
    async fn extract(
        &self,
        page_path: &Path,
        _prompt: &str,
        _metadata_schema: Option<&Value>,
    ) -> PipelineResult<String> {
        let n = page_number(page_path);
        if self.failing_pages.contains(&n) {
            return Err(PipelineError::external(format!("page {} timed out", n)));
        }
        Ok(format!(
            r#"{{"tables": [{{"id": "t1", "name": "Invoice", "columns": ["Item"], "rows": [["row{}"]]}}]}}"#,
            n
        ))
    }
}

/// 抽取时读取运行记录，记下当时的状态
struct RecordingExtractor {
    seen: Arc<Mutex<Vec<(RunStatus, Stage)>>>,
}

#[async_trait]
impl ExtractionService for RecordingExtractor {
    async fn extract(
        &self,
        page_path: &Path,
        _prompt: &str,
        _metadata_schema: Option<&Value>,
    ) -> PipelineResult<String> {
        // <run>/input/pages/page_<n>.txt
        let run_dir = page_path
            .ancestors()
            .nth(3)
            .ok_or_else(|| PipelineError::not_found("run dir"))?;
        let raw = std::fs::read_to_string(run_dir.join("metadata.json"))?;
        let metadata: RunMetadata = serde_json::from_str(&raw)?;
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((metadata.status, metadata.current_stage));
        }
        Ok(MockExtractor::DEFAULT_RESPONSE.to_string())
    }
}

/// 正常返回，但在中间结果目录里留下一个损坏的页文件
struct CorruptingExtractor;

#[async_trait]
impl ExtractionService for CorruptingExtractor {
    async fn extract(
        &self,
        page_path: &Path,
        _prompt: &str,
        _metadata_schema: Option<&Value>,
    ) -> PipelineResult<String> {
        let run_dir = page_path
            .ancestors()
            .nth(3)
            .ok_or_else(|| PipelineError::not_found("run dir"))?;
        std::fs::write(run_dir.join("intermediate/page_7.json"), "{ not json")?;
        Ok(MockExtractor::DEFAULT_RESPONSE.to_string())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    input: PathBuf,
    store: RunStore,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("invoice.png");
    std::fs::write(&input, b"scanned invoice").unwrap();
    let store = RunStore::new(dir.path().join("pipelines"));
    Fixture {
        _dir: dir,
        input,
        store,
    }
}

fn options() -> RunOptions {
    RunOptions::new("Extract all tables.")
}

#[tokio::test]
async fn full_run_with_mock_extractor_completes() {
    let fx = fixture();
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(MockExtractor::default()),
        &Config::default(),
    );

    let run_id = orch.run_document(PIPELINE, &fx.input, &options()).await.unwrap();

    let metadata = orch.metadata(PIPELINE, &run_id).await.unwrap();
    assert_eq!(metadata.status, RunStatus::Completed);
    assert_eq!(metadata.current_stage, Stage::Exporting);
    assert_eq!(metadata.page_count, 1);
    assert!(metadata.error.is_none());

    let pages = fx.store.load_intermediates(PIPELINE, &run_id).await.unwrap();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].message, "Extraction complete");

    let csv_path = fx
        .store
        .run_path(PIPELINE, &run_id)
        .join("output/invoice_items.csv");
    let csv = std::fs::read_to_string(csv_path).unwrap();
    assert_eq!(csv, "Item,Quantity,Price\nWidget A,2,$10.00\nWidget B,1,$25.00\n");
}

#[tokio::test]
async fn one_failing_page_still_completes() {
    let fx = fixture();
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(ScriptedExtractor {
            failing_pages: vec![2],
        }),
        &Config::default(),
    )
    .with_splitter(Arc::new(FixedPageSplitter { pages: 3 }));

    let run_id = orch.run_document(PIPELINE, &fx.input, &options()).await.unwrap();

    let metadata = orch.metadata(PIPELINE, &run_id).await.unwrap();
    assert_eq!(metadata.status, RunStatus::Completed);
    assert_eq!(metadata.page_count, 3);

    let pages = fx.store.load_intermediates(PIPELINE, &run_id).await.unwrap();
    assert!(pages[1].error.as_deref().unwrap().contains("page 2 timed out"));
    assert!(pages[1].tables.is_empty());

    match fx.store.load_aggregated(PIPELINE, &run_id).await.unwrap() {
        AggregatedTables::Structured(tables) => {
            assert_eq!(tables.len(), 1);
            assert_eq!(tables[0].rows, vec![vec!["row1"], vec!["row3"]]);
            assert_eq!(tables[0].pages, vec![1, 3]);
        }
        other => panic!("unexpected aggregated shape: {:?}", other),
    }
}

#[tokio::test]
async fn status_is_scanning_while_pages_are_extracted() {
    let fx = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(RecordingExtractor {
            seen: Arc::clone(&seen),
        }),
        &Config::default(),
    )
    .with_splitter(Arc::new(FixedPageSplitter { pages: 2 }));

    assert_ok!(orch.run_document(PIPELINE, &fx.input, &options()).await);

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            (RunStatus::Scanning, Stage::Scanning),
            (RunStatus::Scanning, Stage::Scanning)
        ]
    );
}

#[tokio::test]
async fn every_stage_is_persisted_before_it_runs() {
    let fx = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let store = fx.store.clone();
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(MockExtractor::default()),
        &Config::default(),
    )
    .with_stage_hook(Arc::new(move |metadata: &RunMetadata| {
        let on_disk = store
            .run_path(&metadata.pipeline_name, &metadata.run_id)
            .join("metadata.json");
        let raw = std::fs::read_to_string(on_disk).unwrap();
        let persisted: RunMetadata = serde_json::from_str(&raw).unwrap();
        recorder
            .lock()
            .unwrap()
            .push((persisted.status, persisted.current_stage));
    }));

    let run_id = orch.run_document(PIPELINE, &fx.input, &options()).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (RunStatus::Scanning, Stage::Scanning),
            (RunStatus::Aggregating, Stage::Aggregating),
            (RunStatus::Exporting, Stage::Exporting),
        ]
    );
    let metadata = orch.metadata(PIPELINE, &run_id).await.unwrap();
    assert_eq!(metadata.status, RunStatus::Completed);
}

#[tokio::test]
async fn corrupt_intermediate_fails_aggregation() {
    let fx = fixture();
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(CorruptingExtractor),
        &Config::default(),
    )
    .with_splitter(Arc::new(FixedPageSplitter { pages: 1 }));

    let run_id = orch.create_run(PIPELINE, &fx.input, None, None).await.unwrap();
    let err = orch.run_stages(PIPELINE, &run_id, &options()).await.unwrap_err();

    assert_eq!(err.failed_stage(), Some(Stage::Aggregating));
    let metadata = orch.metadata(PIPELINE, &run_id).await.unwrap();
    assert_eq!(metadata.status, RunStatus::Failed);
    assert_eq!(metadata.current_stage, Stage::Aggregating);
    let reason = metadata.error.unwrap();
    assert!(!reason.is_empty());
    assert!(reason.contains("page_7.json"));
    assert!(!fx.store.aggregated_path(PIPELINE, &run_id).exists());
}

#[tokio::test]
async fn export_failure_marks_run_failed() {
    let fx = fixture();
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(MockExtractor::default()),
        &Config::default(),
    );
    let run_id = orch.create_run(PIPELINE, &fx.input, None, None).await.unwrap();
    // 输出文件路径被目录占用
    let blocker = fx
        .store
        .run_path(PIPELINE, &run_id)
        .join("output/invoice_items.csv");
    std::fs::create_dir_all(&blocker).unwrap();

    let err = orch.run_stages(PIPELINE, &run_id, &options()).await.unwrap_err();

    assert_eq!(err.failed_stage(), Some(Stage::Exporting));
    let metadata = orch.metadata(PIPELINE, &run_id).await.unwrap();
    assert_eq!(metadata.status, RunStatus::Failed);
    assert_eq!(metadata.current_stage, Stage::Exporting);
    assert!(metadata.error.unwrap().contains("Invoice Items"));
}

#[tokio::test]
async fn missing_input_fails_during_scanning() {
    let fx = fixture();
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(MockExtractor::default()),
        &Config::default(),
    );
    let run_id = orch.create_run(PIPELINE, &fx.input, None, None).await.unwrap();
    let saved = orch
        .metadata(PIPELINE, &run_id)
        .await
        .unwrap()
        .input_file
        .unwrap();
    std::fs::remove_file(saved).unwrap();

    let err = orch.run_stages(PIPELINE, &run_id, &options()).await.unwrap_err();

    assert_eq!(err.failed_stage(), Some(Stage::Scanning));
    let metadata = orch.metadata(PIPELINE, &run_id).await.unwrap();
    assert_eq!(metadata.status, RunStatus::Failed);
    assert!(!metadata.error.unwrap().is_empty());
}

#[tokio::test]
async fn completed_run_reruns_from_scratch() {
    let fx = fixture();
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(MockExtractor::default()),
        &Config::default(),
    );
    let run_id = orch.run_document(PIPELINE, &fx.input, &options()).await.unwrap();
    let stale = fx.store.run_path(PIPELINE, &run_id).join("output/stale.csv");
    std::fs::write(&stale, "old").unwrap();

    orch.run_stages(PIPELINE, &run_id, &options()).await.unwrap();

    assert!(!stale.exists());
    let metadata = orch.metadata(PIPELINE, &run_id).await.unwrap();
    assert_eq!(metadata.status, RunStatus::Completed);
    let outputs = fx.store.list_output_files(PIPELINE, &run_id).await.unwrap();
    assert_eq!(outputs.len(), 1);
}

#[tokio::test]
async fn in_progress_and_initialized_runs_are_refused() {
    let fx = fixture();
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(MockExtractor::default()),
        &Config::default(),
    );

    let run_id = orch.create_run(PIPELINE, &fx.input, None, None).await.unwrap();
    let mut metadata = orch.metadata(PIPELINE, &run_id).await.unwrap();
    metadata.status = RunStatus::Aggregating;
    metadata.current_stage = Stage::Aggregating;
    fx.store.save_metadata(PIPELINE, &run_id, &metadata).await.unwrap();

    let err = orch.run_stages(PIPELINE, &run_id, &options()).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidTransition {
            from: RunStatus::Aggregating,
            ..
        }
    ));
    assert_eq!(orch.metadata(PIPELINE, &run_id).await.unwrap(), metadata);

    let bare = fx.store.create_run(PIPELINE, Some("no-input")).await.unwrap();
    let err = orch.run_stages(PIPELINE, &bare, &options()).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidTransition {
            from: RunStatus::Initialized,
            ..
        }
    ));
}

#[tokio::test]
async fn reaggregation_is_byte_identical() {
    let fx = fixture();
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(ScriptedExtractor {
            failing_pages: vec![],
        }),
        &Config::default(),
    )
    .with_splitter(Arc::new(FixedPageSplitter { pages: 4 }));
    let run_id = orch.run_document(PIPELINE, &fx.input, &options()).await.unwrap();
    let path = fx.store.aggregated_path(PIPELINE, &run_id);
    let first = std::fs::read(&path).unwrap();
    let before = orch.metadata(PIPELINE, &run_id).await.unwrap();

    let result = orch.reaggregate(PIPELINE, &run_id).await.unwrap();

    assert!(result.matches_stored);
    assert_eq!(result.tables.len(), 1);
    assert_eq!(std::fs::read(&path).unwrap(), first);
    assert_eq!(orch.metadata(PIPELINE, &run_id).await.unwrap(), before);
}

#[tokio::test]
async fn reaggregation_never_rewrites_completed_run() {
    let fx = fixture();
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(MockExtractor::default()),
        &Config::default(),
    );
    let run_id = orch.run_document(PIPELINE, &fx.input, &options()).await.unwrap();
    let path = fx.store.aggregated_path(PIPELINE, &run_id);
    std::fs::write(&path, "[]\n").unwrap();

    let result = orch.reaggregate(PIPELINE, &run_id).await.unwrap();

    assert!(!result.matches_stored);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]\n");
    let metadata = orch.metadata(PIPELINE, &run_id).await.unwrap();
    assert_eq!(metadata.status, RunStatus::Completed);

    let err = orch.reaggregate(PIPELINE, "ghost").await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { .. }));
    assert!(!fx.store.run_path(PIPELINE, "ghost").exists());
}

#[tokio::test]
async fn csv_fragment_policy_exports_merged_text() {
    let fx = fixture();
    let config = Config {
        merge_policy: MergePolicy::CsvFragments,
        ..Config::default()
    };
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(ScriptedExtractor {
            failing_pages: vec![],
        }),
        &config,
    )
    .with_splitter(Arc::new(FixedPageSplitter { pages: 2 }));

    let run_id = orch.run_document(PIPELINE, &fx.input, &options()).await.unwrap();

    let csv = std::fs::read_to_string(
        fx.store
            .run_path(PIPELINE, &run_id)
            .join("output/invoice.csv"),
    )
    .unwrap();
    assert_eq!(csv, "Item\nrow1\nrow2\n");
}

#[tokio::test]
async fn deleting_last_run_removes_pipeline_dir() {
    let fx = fixture();
    let orch = RunOrchestrator::new(
        fx.store.clone(),
        Arc::new(MockExtractor::default()),
        &Config::default(),
    );
    let run_id = orch.create_run(PIPELINE, &fx.input, None, None).await.unwrap();

    orch.delete_run(PIPELINE, &run_id).await.unwrap();

    assert!(!fx.store.pipeline_path(PIPELINE).exists());
    assert!(orch.list_run_summaries().await.unwrap().is_empty());
}

/// 需要真实的 API Key 和一份样例 PDF
#[tokio::test]
#[ignore] // 默认忽略，需要手动运行：cargo test -- --ignored
async fn test_real_extraction_run() {
    doc_tracer::logger::init("info");

    let config = Config::from_env();
    let sample = std::env::var("EXTRACTION_SAMPLE_PDF").unwrap_or_else(|_| "sample.pdf".to_string());
    let dir = tempfile::tempdir().unwrap();

    let orch = RunOrchestrator::new(
        RunStore::new(dir.path()),
        doc_tracer::services::extractor_from_config(&config),
        &config,
    );
    let run_id = orch
        .run_document("sample", Path::new(&sample), &RunOptions::new(config.default_prompt.clone()))
        .await
        .expect("运行失败");

    let outputs = orch.store().list_output_files("sample", &run_id).await.unwrap();
    assert!(!outputs.is_empty(), "应该至少导出一张表");
}
