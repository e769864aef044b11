use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use doc_tracer::{logger, App, Config};

#[derive(Parser)]
#[command(name = "doc_tracer", version, about = "从文档中抽取表格并导出为 CSV")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML 配置文件，未指定时只读取环境变量
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 日志级别 (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// 创建运行但不执行
    Create {
        input: PathBuf,
        #[arg(long)]
        pipeline: Option<String>,
        #[arg(long)]
        run_id: Option<String>,
    },
    /// 创建运行并执行全部阶段
    Run {
        input: PathBuf,
        #[arg(long)]
        pipeline: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        /// 每张表的元数据 schema（TOML 或 JSON）
        #[arg(long)]
        metadata_schema: Option<PathBuf>,
    },
    /// 执行已有的运行
    Resume {
        pipeline: String,
        run_id: String,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        metadata_schema: Option<PathBuf>,
    },
    /// 查看运行状态
    Status { pipeline: String, run_id: String },
    /// 列出所有运行
    ListRuns,
    /// 查看运行记录和输出文件
    Info { pipeline: String, run_id: String },
    /// 删除一个运行
    Delete { pipeline: String, run_id: String },
    /// 删除整个流水线
    DeletePipeline { pipeline: String },
    /// 删除全部流水线
    ClearAll {
        #[arg(long)]
        yes: bool,
    },
    /// 目录下每个文档作为独立运行并发执行
    Batch {
        dir: PathBuf,
        #[arg(long)]
        pipeline: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        metadata_schema: Option<PathBuf>,
    },
    /// 用已完成运行的中间结果重新聚合，检查与 tables.json 是否一致
    Aggregate { pipeline: String, run_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 加载配置
    let config = match &cli.config {
        Some(path) => Config::from_toml_file(path)
            .with_context(|| format!("无法加载配置文件: {}", path.display()))?,
        None => Config::from_env(),
    };

    // 初始化日志
    logger::init(cli.log_level.as_deref().unwrap_or(&config.log_level));

    let app = App::initialize(config)?;

    match cli.command {
        Commands::Create { input, pipeline, run_id } => {
            app.create(&input, pipeline.as_deref(), run_id.as_deref()).await
        }
        Commands::Run { input, pipeline, prompt, metadata_schema } => {
            app.run(&input, pipeline.as_deref(), prompt, metadata_schema.as_deref())
                .await
        }
        Commands::Resume { pipeline, run_id, prompt, metadata_schema } => {
            app.resume(&pipeline, &run_id, prompt, metadata_schema.as_deref())
                .await
        }
        Commands::Status { pipeline, run_id } => app.status(&pipeline, &run_id).await,
        Commands::ListRuns => app.list_runs().await,
        Commands::Info { pipeline, run_id } => app.info(&pipeline, &run_id).await,
        Commands::Delete { pipeline, run_id } => app.delete(&pipeline, &run_id).await,
        Commands::DeletePipeline { pipeline } => app.delete_pipeline(&pipeline).await,
        Commands::ClearAll { yes } => app.clear_all(yes).await,
        Commands::Batch { dir, pipeline, prompt, metadata_schema } => {
            app.batch(&dir, pipeline.as_deref(), prompt, metadata_schema.as_deref())
                .await
        }
        Commands::Aggregate { pipeline, run_id } => app.aggregate(&pipeline, &run_id).await,
    }
}
