//! # Doc Tracer
//!
//! 从多页文档中抽取表格、跨页合并并导出为 CSV 的 Rust 流水线
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 唯一持有文件系统布局的模块
//! - `RunStore` - 运行目录、运行记录、中间结果、聚合结果、输出目录
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，不关心运行状态
//! - `DocumentSplitter` - 按页拆分文档
//! - `ExtractionService` - 调用识别服务抽取单页表格
//! - `response_parser` - 解析抽取结果
//! - `aggregator` / `csv_fragments` - 跨页合并
//! - `Exporter` - 导出 CSV
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一页"的完整处理流程
//! - `PageCtx` - 上下文封装（pipeline + run_id + page_num）
//! - `PageFlow` - 抽取 → 解析，失败只影响本页
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/run_orchestrator` - 运行状态机，驱动扫描 / 聚合 / 导出
//! - `orchestrator/batch_processor` - 多个运行并发执行
//!
//! ## 运行状态
//!
//! ```text
//! INITIALIZED → READY → SCANNING → AGGREGATING → EXPORTING → COMPLETED
//!                          ↘            ↘              ↘
//!                                       FAILED
//! ```
//!
//! ## 模块结构

pub mod app;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod logger;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use app::App;
pub use config::Config;
pub use error::{PipelineError, PipelineResult};
pub use infrastructure::RunStore;
pub use models::{AggregatedTable, AggregatedTables, PageResult, RunMetadata, RunReport, RunStatus, Stage, Table};
pub use orchestrator::{BatchRunner, RunOptions, RunOrchestrator};
pub use services::{ExtractionService, MergePolicy, MockExtractor};
pub use workflow::{PageCtx, PageFlow};
