//! 运行编排器 - 编排层
//!
//! ## 职责
//!
//! 驱动单个运行走完状态机，是运行级别的编排器。
//!
//! ## 核心功能
//!
//! 1. **创建运行**：建目录、保存输入文件，`INITIALIZED → READY`
//! 2. **执行阶段**：扫描 → 聚合 → 导出，进入每个阶段前先落盘状态
//! 3. **失败记录**：阶段出错时写入 `FAILED` 和错误信息，再把错误返回给调用方
//! 4. **单页隔离**：扫描阶段某页抽取失败只记录在该页结果中，扫描继续
//! 5. **查询与清理**：运行报告、运行列表、删除
//!
//! 状态只通过 `metadata.json` 传递，调用方不需要持有编排器就能知道运行进度

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::infrastructure::RunStore;
use crate::models::{
    AggregatedTables, ExportRecord, RunMetadata, RunReport, RunStatus, RunSummary, Stage,
};
use crate::services::{aggregate, splitter_for, DocumentSplitter, ExtractionService, Exporter, MergePolicy};
use crate::workflow::{PageCtx, PageFlow};

/// 单次运行的参数
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub prompt: String,
    pub metadata_schema: Option<Value>,
}

impl RunOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            metadata_schema: None,
        }
    }

    pub fn with_metadata_schema(mut self, schema: Value) -> Self {
        self.metadata_schema = Some(schema);
        self
    }
}

/// 重新聚合的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Reaggregation {
    pub tables: AggregatedTables,
    /// 与已保存的 tables.json 逐字节相同
    pub matches_stored: bool,
}

/// 每次进入新阶段、状态落盘之后调用
pub type StageHook = Arc<dyn Fn(&RunMetadata) + Send + Sync>;

/// 运行编排器
///
/// 抽取服务由调用方显式构造后传入，不存在进程级单例
#[derive(Clone)]
pub struct RunOrchestrator {
    store: RunStore,
    extractor: Arc<dyn ExtractionService>,
    merge_policy: MergePolicy,
    exporter: Exporter,
    /// 未设置时按输入文件扩展名选择
    splitter: Option<Arc<dyn DocumentSplitter>>,
    stage_hook: Option<StageHook>,
    verbose_logging: bool,
}

impl RunOrchestrator {
    pub fn new(store: RunStore, extractor: Arc<dyn ExtractionService>, config: &Config) -> Self {
        Self {
            store,
            extractor,
            merge_policy: config.merge_policy,
            exporter: Exporter::new(config.export_strict),
            splitter: None,
            stage_hook: None,
            verbose_logging: config.verbose_logging,
        }
    }

    /// 固定使用某个拆分器
    pub fn with_splitter(mut self, splitter: Arc<dyn DocumentSplitter>) -> Self {
        self.splitter = Some(splitter);
        self
    }

    pub fn with_stage_hook(mut self, hook: StageHook) -> Self {
        self.stage_hook = Some(hook);
        self
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.merge_policy
    }

    // ========== 创建 ==========

    /// 创建运行并保存输入文件，成功后运行处于 `READY`
    ///
    /// `filename` 为空时使用输入文件自身的文件名。保存输入失败时运行被标记为 `FAILED`
    pub async fn create_run(
        &self,
        pipeline_name: &str,
        input: &Path,
        filename: Option<&str>,
        run_id: Option<&str>,
    ) -> PipelineResult<String> {
        // 文件名不合法时不留下运行目录
        let filename = match filename {
            Some(name) => name.to_string(),
            None => input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| PipelineError::InvalidName(input.display().to_string()))?,
        };

        let run_id = self.store.create_run(pipeline_name, run_id).await?;
        let mut metadata = self.store.load_metadata(pipeline_name, &run_id).await?;

        match self
            .store
            .save_input_file(pipeline_name, &run_id, input, &filename)
            .await
        {
            Ok(saved) => {
                metadata.input_file = Some(saved);
                advance(&mut metadata, RunStatus::Ready)?;
                self.store
                    .save_metadata(pipeline_name, &run_id, &metadata)
                    .await?;
                info!("✓ 运行 {}/{} 已就绪", pipeline_name, run_id);
                Ok(run_id)
            }
            Err(e) => {
                self.record_failure(pipeline_name, &run_id, &mut metadata, &e)
                    .await;
                Err(PipelineError::RunFailed {
                    stage: Stage::Setup,
                    source: Box::new(e),
                })
            }
        }
    }

    /// 创建并立即执行，返回运行 ID
    pub async fn run_document(
        &self,
        pipeline_name: &str,
        input: &Path,
        options: &RunOptions,
    ) -> PipelineResult<String> {
        let run_id = self.create_run(pipeline_name, input, None, None).await?;
        self.run_stages(pipeline_name, &run_id, options).await?;
        Ok(run_id)
    }

    // ========== 执行 ==========

    /// 依次执行扫描、聚合、导出
    ///
    /// - `READY`：直接执行
    /// - `COMPLETED` / `FAILED`：清空产物后从头重新执行
    /// - 执行中或 `INITIALIZED`：拒绝，返回 `InvalidTransition`
    pub async fn run_stages(
        &self,
        pipeline_name: &str,
        run_id: &str,
        options: &RunOptions,
    ) -> PipelineResult<()> {
        let mut metadata = self.existing_metadata(pipeline_name, run_id).await?;

        match metadata.status {
            RunStatus::Ready => {}
            status if status.is_terminal() => {
                info!("♻️ 运行 {}/{} 已结束 ({})，清空后重新执行", pipeline_name, run_id, status);
                self.store.reset_artifacts(pipeline_name, run_id).await?;
                reset(&mut metadata)?;
                self.store
                    .save_metadata(pipeline_name, run_id, &metadata)
                    .await?;
            }
            status => {
                return Err(PipelineError::InvalidTransition {
                    from: status,
                    to: RunStatus::Scanning,
                })
            }
        }

        for stage in Stage::PIPELINE {
            metadata.current_stage = stage;
            advance(&mut metadata, stage.status())?;
            self.store
                .save_metadata(pipeline_name, run_id, &metadata)
                .await?;
            info!("▶️ 运行 {}/{} 进入 {} 阶段", pipeline_name, run_id, stage);
            if let Some(hook) = &self.stage_hook {
                hook(&metadata);
            }

            let result = match stage {
                Stage::Scanning => self
                    .scan(pipeline_name, run_id, options, &mut metadata)
                    .await
                    .map(|_| ()),
                Stage::Aggregating => self
                    .aggregate_stage(pipeline_name, run_id)
                    .await
                    .map(|_| ()),
                Stage::Exporting => self.export_stage(pipeline_name, run_id).await.map(|_| ()),
                Stage::Setup => Ok(()),
            };

            if let Err(e) = result {
                error!("❌ 运行 {}/{} 在 {} 阶段失败: {}", pipeline_name, run_id, stage, e);
                self.record_failure(pipeline_name, run_id, &mut metadata, &e)
                    .await;
                return Err(PipelineError::RunFailed {
                    stage,
                    source: Box::new(e),
                });
            }
        }

        advance(&mut metadata, RunStatus::Completed)?;
        self.store
            .save_metadata(pipeline_name, run_id, &metadata)
            .await?;
        info!("✅ 运行 {}/{} 已完成", pipeline_name, run_id);
        Ok(())
    }

    /// 扫描阶段：拆页，逐页抽取并保存中间结果，返回页数
    async fn scan(
        &self,
        pipeline_name: &str,
        run_id: &str,
        options: &RunOptions,
        metadata: &mut RunMetadata,
    ) -> PipelineResult<usize> {
        let input = metadata
            .input_file
            .clone()
            .ok_or_else(|| PipelineError::not_found(format!("运行 {}/{} 的输入文件", pipeline_name, run_id)))?;
        if !tokio::fs::try_exists(&input).await.unwrap_or(false) {
            return Err(PipelineError::not_found(input.display().to_string()));
        }

        self.store.clear_intermediates(pipeline_name, run_id).await?;

        let page_files = self.split(&input, self.store.pages_dir(pipeline_name, run_id)).await?;
        let page_count = page_files.len();
        metadata.page_count = page_count;
        self.store
            .save_metadata(pipeline_name, run_id, metadata)
            .await?;
        info!("📄 运行 {}/{} 共 {} 页", pipeline_name, run_id, page_count);

        let flow = PageFlow::new(
            Arc::clone(&self.extractor),
            options.prompt.clone(),
            options.metadata_schema.clone(),
            self.verbose_logging,
        );

        let mut failed_pages = 0;
        for (index, page_path) in page_files.iter().enumerate() {
            let page_num = index + 1;
            let ctx = PageCtx::new(pipeline_name, run_id, page_num, page_count);
            let page = flow.run(page_path, &ctx).await;
            if page.is_failed() {
                failed_pages += 1;
            }
            self.store
                .save_intermediate(pipeline_name, run_id, page_num, &page)
                .await?;
        }

        if failed_pages > 0 {
            warn!(
                "⚠️ 运行 {}/{} 扫描完成，{}/{} 页抽取失败",
                pipeline_name, run_id, failed_pages, page_count
            );
        } else {
            info!("✓ 运行 {}/{} 扫描完成", pipeline_name, run_id);
        }
        Ok(page_count)
    }

    /// 拆分是同步文件操作，放到阻塞线程池里执行
    async fn split(&self, input: &Path, pages_dir: PathBuf) -> PipelineResult<Vec<PathBuf>> {
        let splitter = self
            .splitter
            .clone()
            .unwrap_or_else(|| splitter_for(input));
        let input = input.to_path_buf();
        let dir = pages_dir.clone();

        tokio::task::spawn_blocking(move || splitter.split(&input, &dir))
            .await
            .map_err(|e| PipelineError::io_message(&pages_dir, e))?
    }

    /// 聚合阶段：读取全部中间结果，合并后整体写入 tables.json
    async fn aggregate_stage(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<AggregatedTables> {
        let pages = self.store.load_intermediates(pipeline_name, run_id).await?;
        let tables = aggregate(&pages, self.merge_policy);
        self.store
            .save_aggregated(pipeline_name, run_id, &tables)
            .await?;
        info!(
            "✓ 运行 {}/{} 聚合完成: {} 页 -> {} 张表 ({})",
            pipeline_name,
            run_id,
            pages.len(),
            tables.len(),
            self.merge_policy
        );
        Ok(tables)
    }

    /// 只对 `COMPLETED` 的运行重新聚合，结果与已保存的 tables.json 比较
    ///
    /// 不写任何文件，运行状态和输出保持不变
    pub async fn reaggregate(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<Reaggregation> {
        let metadata = self.existing_metadata(pipeline_name, run_id).await?;
        if metadata.status != RunStatus::Completed {
            return Err(PipelineError::InvalidTransition {
                from: metadata.status,
                to: RunStatus::Aggregating,
            });
        }

        let pages = self.store.load_intermediates(pipeline_name, run_id).await?;
        let tables = aggregate(&pages, self.merge_policy);
        let matches_stored = self
            .store
            .aggregated_matches(pipeline_name, run_id, &tables)
            .await?;
        if !matches_stored {
            warn!(
                "⚠️ 运行 {}/{} 重新聚合的结果与已保存的 tables.json 不同 ({})",
                pipeline_name, run_id, self.merge_policy
            );
        }
        Ok(Reaggregation {
            tables,
            matches_stored,
        })
    }

    /// 导出阶段：tables.json 缺失视为 `NotFound`
    async fn export_stage(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<Vec<ExportRecord>> {
        let tables = self.store.load_aggregated(pipeline_name, run_id).await?;
        let output_dir = self.store.output_path(pipeline_name, run_id).await?;
        let records = self.exporter.export(&tables, &output_dir).await?;
        info!(
            "✓ 运行 {}/{} 导出完成: {} 个文件",
            pipeline_name,
            run_id,
            records.len()
        );
        Ok(records)
    }

    /// 写入 `FAILED` 和错误信息。写入本身失败时只记日志，调用方仍返回原始错误
    async fn record_failure(
        &self,
        pipeline_name: &str,
        run_id: &str,
        metadata: &mut RunMetadata,
        cause: &PipelineError,
    ) {
        metadata.status = RunStatus::Failed;
        metadata.error = Some(cause.to_string());
        if let Err(e) = self
            .store
            .save_metadata(pipeline_name, run_id, metadata)
            .await
        {
            error!("❌ 无法记录运行 {}/{} 的失败状态: {}", pipeline_name, run_id, e);
        }
    }

    // ========== 查询 ==========

    async fn existing_metadata(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<RunMetadata> {
        if !self.store.run_exists(pipeline_name, run_id).await {
            return Err(PipelineError::not_found(format!("运行 {}/{}", pipeline_name, run_id)));
        }
        self.store.load_metadata(pipeline_name, run_id).await
    }

    /// 运行记录原样返回
    pub async fn metadata(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<RunMetadata> {
        self.existing_metadata(pipeline_name, run_id).await
    }

    /// 运行报告，记录损坏时为 `Unknown`
    pub async fn report(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<RunReport> {
        match self.existing_metadata(pipeline_name, run_id).await {
            Ok(metadata) => Ok(RunReport::from(&metadata)),
            Err(PipelineError::CorruptData { .. }) => Ok(RunReport::Unknown),
            Err(e) => Err(e),
        }
    }

    /// 列出所有流水线下的所有运行
    pub async fn list_run_summaries(&self) -> PipelineResult<Vec<RunSummary>> {
        let mut summaries = Vec::new();
        for pipeline_name in self.store.list_pipelines().await? {
            for run_id in self.store.list_runs(&pipeline_name).await? {
                let summary = match self.store.load_metadata(&pipeline_name, &run_id).await {
                    Ok(metadata) => RunSummary {
                        report: RunReport::from(&metadata),
                        page_count: metadata.page_count,
                        created_at: metadata.created_at,
                        pipeline_name: pipeline_name.clone(),
                        run_id,
                    },
                    Err(e) => {
                        warn!("⚠️ 运行 {}/{} 的记录无法读取: {}", pipeline_name, run_id, e);
                        RunSummary {
                            pipeline_name: pipeline_name.clone(),
                            run_id,
                            report: RunReport::Unknown,
                            page_count: 0,
                            created_at: None,
                        }
                    }
                };
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    // ========== 清理 ==========

    pub async fn delete_run(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<()> {
        self.store.delete_run(pipeline_name, run_id).await
    }

    pub async fn delete_pipeline(&self, pipeline_name: &str) -> PipelineResult<()> {
        self.store.delete_pipeline(pipeline_name).await
    }

    pub async fn clear_all(&self) -> PipelineResult<()> {
        self.store.clear_all().await
    }
}

/// 终止状态回到 `READY`，清空上一次执行的进度和错误
fn reset(metadata: &mut RunMetadata) -> PipelineResult<()> {
    if !metadata.status.can_reset() {
        return Err(PipelineError::InvalidTransition {
            from: metadata.status,
            to: RunStatus::Ready,
        });
    }
    metadata.status = RunStatus::Ready;
    metadata.current_stage = Stage::Setup;
    metadata.page_count = 0;
    metadata.error = None;
    Ok(())
}

/// 沿状态机前进一步，非法转换返回 `InvalidTransition`
fn advance(metadata: &mut RunMetadata, next: RunStatus) -> PipelineResult<()> {
    if !metadata.status.can_transition_to(next) {
        return Err(PipelineError::InvalidTransition {
            from: metadata.status,
            to: next,
        });
    }
    metadata.status = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MockExtractor;
    use tokio_test::assert_err;

    fn orchestrator(base: &Path) -> RunOrchestrator {
        RunOrchestrator::new(
            RunStore::new(base),
            Arc::new(MockExtractor::default()),
            &Config::default(),
        )
    }

    #[test]
    fn advance_rejects_skipping_stages() {
        let mut metadata = RunMetadata::initialized("p", "r");
        let err = advance(&mut metadata, RunStatus::Scanning).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: RunStatus::Initialized,
                to: RunStatus::Scanning
            }
        ));
        assert_eq!(metadata.status, RunStatus::Initialized);
    }

    #[test]
    fn reset_only_leaves_terminal_states() {
        let mut metadata = RunMetadata::initialized("p", "r");
        metadata.status = RunStatus::Failed;
        metadata.current_stage = Stage::Exporting;
        metadata.page_count = 4;
        metadata.error = Some("boom".to_string());

        reset(&mut metadata).unwrap();
        assert_eq!(metadata.status, RunStatus::Ready);
        assert_eq!(metadata.current_stage, Stage::Setup);
        assert_eq!(metadata.page_count, 0);
        assert!(metadata.error.is_none());

        let err = reset(&mut metadata).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: RunStatus::Ready,
                to: RunStatus::Ready
            }
        ));
    }

    #[tokio::test]
    async fn input_without_file_name_leaves_no_run() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("pipelines"));

        let err = orch
            .create_run("invoices", Path::new(".."), None, Some("run-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::InvalidName(_)));
        assert!(!orch.store().run_exists("invoices", "run-1").await);
        assert!(orch.list_run_summaries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reaggregate_needs_existing_completed_run() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("pipelines");
        let input = dir.path().join("invoice.png");
        std::fs::write(&input, b"image").unwrap();
        let orch = orchestrator(&base);

        let err = orch.reaggregate("invoices", "ghost").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
        assert!(!base.join("invoices").exists());

        let err = orch.reaggregate("..", "escape").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
        assert!(!dir.path().join("escape").exists());

        let run_id = orch
            .create_run("invoices", &input, None, Some("run-1"))
            .await
            .unwrap();
        let err = orch.reaggregate("invoices", &run_id).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: RunStatus::Ready,
                to: RunStatus::Aggregating
            }
        ));
        assert!(!orch.store().aggregated_path("invoices", &run_id).exists());
    }

    #[tokio::test]
    async fn create_run_ends_ready_with_input_saved() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("invoice.png");
        std::fs::write(&input, b"image").unwrap();
        let orch = orchestrator(&dir.path().join("pipelines"));

        let run_id = orch
            .create_run("invoices", &input, None, Some("run-1"))
            .await
            .unwrap();

        let metadata = orch.metadata("invoices", &run_id).await.unwrap();
        assert_eq!(metadata.status, RunStatus::Ready);
        let saved = metadata.input_file.unwrap();
        assert!(saved.ends_with("input/invoice.png"));
        assert!(saved.is_file());
    }

    #[tokio::test]
    async fn missing_source_fails_creation() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());

        let err = orch
            .create_run("invoices", &dir.path().join("nope.pdf"), None, Some("run-1"))
            .await
            .unwrap_err();

        assert_eq!(err.failed_stage(), Some(Stage::Setup));
        let metadata = orch.metadata("invoices", "run-1").await.unwrap();
        assert_eq!(metadata.status, RunStatus::Failed);
        assert!(metadata.error.is_some());
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());

        let err = orch
            .run_stages("invoices", "ghost", &RunOptions::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
        assert_err!(orch.report("invoices", "ghost").await);
    }

    #[tokio::test]
    async fn corrupt_record_reports_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let run_path = dir.path().join("invoices/run-1");
        std::fs::create_dir_all(&run_path).unwrap();
        std::fs::write(run_path.join("metadata.json"), "{ not json").unwrap();

        assert_eq!(orch.report("invoices", "run-1").await.unwrap(), RunReport::Unknown);

        let summaries = orch.list_run_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].report.to_string(), "CORRUPT");
    }
}
