//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责运行的状态流转和批量调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `run_orchestrator` - 单个运行的编排器
//! - 创建运行（INITIALIZED → READY）
//! - 依次执行扫描 / 聚合 / 导出，每个阶段开始前落盘状态
//! - 阶段失败时记录 FAILED 和错误信息
//! - 运行报告、列表和删除
//!
//! ### `batch_processor` - 批量运行处理器
//! - 扫描输入目录
//! - 控制并发数量（Semaphore）
//! - 输出全局统计信息
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<文档>)
//!     ↓
//! run_orchestrator (处理单个运行的各个阶段)
//!     ↓
//! workflow::PageFlow (处理单页)
//!     ↓
//! services (能力层：split / extract / parse / aggregate / export)
//!     ↓
//! infrastructure (基础设施：RunStore)
//! ```

pub mod batch_processor;
pub mod run_orchestrator;

// 重新导出主要类型
pub use batch_processor::{collect_inputs, BatchOutcome, BatchRunner, BatchStats};
pub use run_orchestrator::{Reaggregation, RunOptions, RunOrchestrator, StageHook};
