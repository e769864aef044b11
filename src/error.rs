use std::fmt::Display;
use std::path::Path;

use thiserror::Error;

use crate::models::{RunStatus, Stage};

/// 流水线错误类型
///
/// 分类：
/// - `NotFound` - 运行 / 流水线 / 文件不存在
/// - `Io` - 复制、写入等文件操作失败
/// - `CorruptData` - 持久化的 JSON 无法解析
/// - `ExternalService` - 抽取服务调用失败（按页隔离）
/// - `RunFailed` - 阶段失败，已记录为终止状态
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 运行、流水线或文件不存在
    #[error("未找到: {what}")]
    NotFound { what: String },

    /// 运行目录已存在且非空
    #[error("运行已存在: {path}")]
    AlreadyExists { path: String },

    /// 文件操作失败
    #[error("IO 错误 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// 持久化数据损坏
    #[error("数据损坏 ({path}): {reason}")]
    CorruptData { path: String, reason: String },

    /// 外部抽取服务错误
    #[error("外部服务错误: {0}")]
    ExternalService(String),

    /// CSV 写入失败
    #[error("CSV 写入失败 ({table}): {source}")]
    Csv {
        table: String,
        #[source]
        source: csv::Error,
    },

    /// 严格模式下存在导出失败的表
    #[error("导出失败的表: {}", .failed.join(", "))]
    ExportFailed { failed: Vec<String> },

    /// 非法的状态转换
    #[error("非法状态转换: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    /// 名称包含路径分隔符等非法字符
    #[error("非法名称: {0:?}")]
    InvalidName(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 阶段失败，运行已标记为 FAILED
    #[error("运行在 {stage} 阶段失败: {source}")]
    RunFailed {
        stage: Stage,
        #[source]
        source: Box<PipelineError>,
    },
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io {
            path: String::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::CorruptData {
            path: String::new(),
            reason: err.to_string(),
        }
    }
}

// ========== 便捷构造函数 ==========

impl PipelineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        PipelineError::NotFound { what: what.into() }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// 将第三方库的错误信息包装成 IO 错误
    pub fn io_message(path: impl AsRef<Path>, message: impl Display) -> Self {
        Self::io(path, std::io::Error::other(message.to_string()))
    }

    pub fn corrupt(path: impl AsRef<Path>, reason: impl Display) -> Self {
        PipelineError::CorruptData {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn external(message: impl Display) -> Self {
        PipelineError::ExternalService(message.to_string())
    }

    /// 失败阶段（仅 `RunFailed` 有值）
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            PipelineError::RunFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// 流水线结果类型
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_failed_message_carries_stage_and_cause() {
        let err = PipelineError::RunFailed {
            stage: Stage::Exporting,
            source: Box::new(PipelineError::ExportFailed {
                failed: vec!["Invoice".to_string(), "Totals".to_string()],
            }),
        };

        let text = err.to_string();
        assert!(text.contains("EXPORTING"));
        assert!(text.contains("Invoice, Totals"));
        assert_eq!(err.failed_stage(), Some(Stage::Exporting));
    }

    #[test]
    fn io_message_keeps_path() {
        let err = PipelineError::io_message("/tmp/a.pdf", "boom");
        assert_eq!(err.to_string(), "IO 错误 (/tmp/a.pdf): boom");
    }
}
