//! 命令行命令的实现
//!
//! 每个子命令对应 `App` 的一个方法，错误统一用 `anyhow` 加上下文后返回

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::infrastructure::RunStore;
use crate::models::{load_metadata_schema, RunReport};
use crate::orchestrator::{collect_inputs, BatchRunner, BatchStats, RunOptions, RunOrchestrator};
use crate::services::extractor_from_config;
use crate::utils::logging::{
    init_log_file, log_documents_loaded, log_run_start, log_startup, print_final_stats, truncate_text,
};

/// 应用主结构
pub struct App {
    config: Config,
    orchestrator: RunOrchestrator,
}

impl App {
    /// 初始化应用：日志文件、运行存储、抽取服务
    pub fn initialize(config: Config) -> Result<Self> {
        if let Some(log_file) = &config.output_log_file {
            init_log_file(log_file).with_context(|| format!("无法写入日志文件: {}", log_file))?;
        }

        log_startup(
            &config.pipelines_dir.display().to_string(),
            config.max_concurrent_runs,
        );

        let store = RunStore::new(&config.pipelines_dir);
        let extractor = extractor_from_config(&config);
        let orchestrator = RunOrchestrator::new(store, extractor, &config);

        Ok(Self {
            config,
            orchestrator,
        })
    }

    pub fn orchestrator(&self) -> &RunOrchestrator {
        &self.orchestrator
    }

    fn pipeline_name<'a>(&'a self, pipeline: Option<&'a str>) -> &'a str {
        pipeline.unwrap_or(&self.config.default_pipeline)
    }

    async fn run_options(&self, prompt: Option<String>, schema: Option<&Path>) -> Result<RunOptions> {
        let mut options = RunOptions::new(prompt.unwrap_or_else(|| self.config.default_prompt.clone()));
        if let Some(path) = schema {
            let schema = load_metadata_schema(path)
                .await
                .with_context(|| format!("无法加载元数据 schema: {}", path.display()))?;
            options = options.with_metadata_schema(schema);
        }
        Ok(options)
    }

    /// `create`：只创建运行，不执行
    pub async fn create(&self, input: &Path, pipeline: Option<&str>, run_id: Option<&str>) -> Result<()> {
        let pipeline_name = self.pipeline_name(pipeline);
        let run_id = self
            .orchestrator
            .create_run(pipeline_name, input, None, run_id)
            .await
            .with_context(|| format!("无法为 {} 创建运行", input.display()))?;
        println!("{}/{}", pipeline_name, run_id);
        Ok(())
    }

    /// `run`：创建并执行
    pub async fn run(
        &self,
        input: &Path,
        pipeline: Option<&str>,
        prompt: Option<String>,
        schema: Option<&Path>,
    ) -> Result<()> {
        let pipeline_name = self.pipeline_name(pipeline);
        let options = self.run_options(prompt, schema).await?;

        let run_id = self
            .orchestrator
            .create_run(pipeline_name, input, None, None)
            .await
            .with_context(|| format!("无法为 {} 创建运行", input.display()))?;
        log_run_start(pipeline_name, &run_id, &input.display().to_string());

        self.execute(pipeline_name, &run_id, &options).await
    }

    /// `resume`：执行已有运行（READY，或已结束的运行重新执行）
    pub async fn resume(
        &self,
        pipeline: &str,
        run_id: &str,
        prompt: Option<String>,
        schema: Option<&Path>,
    ) -> Result<()> {
        let options = self.run_options(prompt, schema).await?;
        self.execute(pipeline, run_id, &options).await
    }

    async fn execute(&self, pipeline_name: &str, run_id: &str, options: &RunOptions) -> Result<()> {
        self.orchestrator
            .run_stages(pipeline_name, run_id, options)
            .await
            .with_context(|| format!("运行 {}/{} 失败", pipeline_name, run_id))?;

        let outputs = self
            .orchestrator
            .store()
            .list_output_files(pipeline_name, run_id)
            .await?;
        println!("✅ {}/{} COMPLETED", pipeline_name, run_id);
        for path in outputs {
            println!("  {}", path.display());
        }
        Ok(())
    }

    /// `status`
    pub async fn status(&self, pipeline: &str, run_id: &str) -> Result<()> {
        let report = self
            .orchestrator
            .report(pipeline, run_id)
            .await
            .with_context(|| format!("无法读取运行 {}/{}", pipeline, run_id))?;
        println!("{}/{}: {}", pipeline, run_id, report);
        if matches!(report, RunReport::InProgress(_)) {
            warn!("⚠️ 运行停留在执行阶段；若进程已退出，该运行不会自动恢复，可删除后重新创建");
        }
        Ok(())
    }

    /// `list-runs`
    pub async fn list_runs(&self) -> Result<()> {
        let summaries = self.orchestrator.list_run_summaries().await?;
        if summaries.is_empty() {
            println!("没有任何运行");
            return Ok(());
        }

        println!(
            "{:<20} {:<38} {:<24} {:>6}  {}",
            "PIPELINE", "RUN ID", "STATUS", "PAGES", "CREATED"
        );
        for s in summaries {
            let created = s
                .created_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            let status = truncate_text(&s.report.to_string(), 24);
            println!(
                "{:<20} {:<38} {:<24} {:>6}  {}",
                s.pipeline_name, s.run_id, status, s.page_count, created
            );
        }
        Ok(())
    }

    /// `info`：运行记录 + 输出文件
    pub async fn info(&self, pipeline: &str, run_id: &str) -> Result<()> {
        let metadata = self
            .orchestrator
            .metadata(pipeline, run_id)
            .await
            .with_context(|| format!("无法读取运行 {}/{}", pipeline, run_id))?;
        println!("{}", serde_json::to_string_pretty(&metadata)?);

        let outputs = self
            .orchestrator
            .store()
            .list_output_files(pipeline, run_id)
            .await?;
        println!("\n输出文件 ({}):", outputs.len());
        for path in outputs {
            println!("  {}", path.display());
        }
        Ok(())
    }

    /// `aggregate`：对已完成的运行重新聚合并与已保存结果比较，不写文件
    pub async fn aggregate(&self, pipeline: &str, run_id: &str) -> Result<()> {
        let result = self
            .orchestrator
            .reaggregate(pipeline, run_id)
            .await
            .with_context(|| format!("运行 {}/{} 聚合失败", pipeline, run_id))?;
        println!(
            "{} 张表: {}",
            result.tables.len(),
            result.tables.names().join(", ")
        );
        if !result.matches_stored {
            bail!("运行 {}/{} 重新聚合的结果与 tables.json 不一致", pipeline, run_id);
        }
        println!("与 tables.json 一致");
        Ok(())
    }

    pub async fn delete(&self, pipeline: &str, run_id: &str) -> Result<()> {
        self.orchestrator
            .delete_run(pipeline, run_id)
            .await
            .with_context(|| format!("无法删除运行 {}/{}", pipeline, run_id))?;
        println!("已删除 {}/{}", pipeline, run_id);
        Ok(())
    }

    pub async fn delete_pipeline(&self, pipeline: &str) -> Result<()> {
        self.orchestrator
            .delete_pipeline(pipeline)
            .await
            .with_context(|| format!("无法删除流水线 {}", pipeline))?;
        println!("已删除流水线 {}", pipeline);
        Ok(())
    }

    pub async fn clear_all(&self, confirmed: bool) -> Result<()> {
        if !confirmed {
            bail!(
                "clear-all 会删除 {} 下的全部运行，确认请加 --yes",
                self.config.pipelines_dir.display()
            );
        }
        self.orchestrator.clear_all().await?;
        println!("已清空 {}", self.config.pipelines_dir.display());
        Ok(())
    }

    /// `batch`：目录下每个文档作为一个独立运行并发执行
    pub async fn batch(
        &self,
        dir: &Path,
        pipeline: Option<&str>,
        prompt: Option<String>,
        schema: Option<&Path>,
    ) -> Result<()> {
        let pipeline_name = self.pipeline_name(pipeline);
        let options = self.run_options(prompt, schema).await?;

        info!("\n📁 正在扫描待处理的文档...");
        let inputs: Vec<PathBuf> = collect_inputs(dir)
            .await
            .with_context(|| format!("无法读取输入目录: {}", dir.display()))?;
        if inputs.is_empty() {
            warn!("⚠️ 没有找到待处理的文档，程序结束");
            return Ok(());
        }
        log_documents_loaded(inputs.len(), self.config.max_concurrent_runs);

        let runner = BatchRunner::new(self.orchestrator.clone(), self.config.max_concurrent_runs);
        let outcomes = runner.run_all(pipeline_name, inputs, &options).await;

        for outcome in &outcomes {
            let run = outcome.run_id.as_deref().unwrap_or("-");
            match &outcome.error {
                None => println!("✅ {} -> {}/{}", outcome.input.display(), pipeline_name, run),
                Some(e) => println!("❌ {} -> {}/{}: {}", outcome.input.display(), pipeline_name, run, e),
            }
        }

        let stats = BatchStats::from_outcomes(&outcomes);
        print_final_stats(
            stats.success,
            stats.failed,
            stats.total,
            self.config.output_log_file.as_deref(),
        );

        if stats.failed > 0 {
            bail!("{}/{} 个运行失败", stats.failed, stats.total);
        }
        Ok(())
    }
}
