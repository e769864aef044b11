//! 基础设施层（Infrastructure）
//!
//! 持有稀缺资源（运行目录），只暴露读写能力

pub mod run_store;

pub use run_store::RunStore;
