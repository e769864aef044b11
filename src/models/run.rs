//! 运行记录（metadata.json）
//!
//! 运行状态的唯一事实来源，每次变更都整体覆盖写入

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 运行状态
///
/// 成功路径：`INITIALIZED → READY → SCANNING → AGGREGATING → EXPORTING → COMPLETED`，
/// 任何非终止状态都可以跳到 `FAILED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Initialized,
    Ready,
    Scanning,
    Aggregating,
    Exporting,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Initialized => "INITIALIZED",
            RunStatus::Ready => "READY",
            RunStatus::Scanning => "SCANNING",
            RunStatus::Aggregating => "AGGREGATING",
            RunStatus::Exporting => "EXPORTING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// 阶段执行中（进程被杀掉后也会停留在这里）
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            RunStatus::Scanning | RunStatus::Aggregating | RunStatus::Exporting
        )
    }

    /// 成功路径上的位置，`FAILED` 不在成功路径上
    fn position(&self) -> Option<u8> {
        match self {
            RunStatus::Initialized => Some(0),
            RunStatus::Ready => Some(1),
            RunStatus::Scanning => Some(2),
            RunStatus::Aggregating => Some(3),
            RunStatus::Exporting => Some(4),
            RunStatus::Completed => Some(5),
            RunStatus::Failed => None,
        }
    }

    /// 是否允许从当前状态转换到 `next`
    ///
    /// 只能沿成功路径前进一步，或从非终止状态进入 `FAILED`
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == RunStatus::Failed {
            return true;
        }
        match (self.position(), next.position()) {
            (Some(from), Some(to)) => to == from + 1,
            _ => false,
        }
    }

    /// 重新执行前的重置：只有终止状态能回到 `READY`
    ///
    /// 这是唯一离开终止状态的转换，不经过 `can_transition_to`
    pub fn can_reset(&self) -> bool {
        self.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 当前阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    #[default]
    Setup,
    Scanning,
    Aggregating,
    Exporting,
}

impl Stage {
    /// 按执行顺序排列的三个阶段
    pub const PIPELINE: [Stage; 3] = [Stage::Scanning, Stage::Aggregating, Stage::Exporting];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "SETUP",
            Stage::Scanning => "SCANNING",
            Stage::Aggregating => "AGGREGATING",
            Stage::Exporting => "EXPORTING",
        }
    }

    /// 进入该阶段时运行应处于的状态
    pub fn status(&self) -> RunStatus {
        match self {
            Stage::Setup => RunStatus::Initialized,
            Stage::Scanning => RunStatus::Scanning,
            Stage::Aggregating => RunStatus::Aggregating,
            Stage::Exporting => RunStatus::Exporting,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 运行记录
///
/// 文件不存在时读取得到 `Default`，而不是错误
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    #[serde(default)]
    pub pipeline_name: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub current_stage: Stage,
    #[serde(default)]
    pub page_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunMetadata {
    /// 新建运行时写入的初始记录
    pub fn initialized(pipeline_name: &str, run_id: &str) -> Self {
        Self {
            pipeline_name: pipeline_name.to_string(),
            run_id: run_id.to_string(),
            status: RunStatus::Initialized,
            current_stage: Stage::Setup,
            page_count: 0,
            created_at: Some(Utc::now()),
            input_file: None,
            error: None,
        }
    }

    /// 是否是"文件不存在"时返回的空记录
    pub fn is_empty(&self) -> bool {
        self.run_id.is_empty() && self.created_at.is_none()
    }
}

/// 只读取运行记录就能得到的运行报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    /// 记录缺失或损坏
    Unknown,
    Initialized,
    Ready,
    /// 正在执行（或进程中断后卡住）的阶段
    InProgress(Stage),
    Completed,
    Failed(String),
}

impl From<&RunMetadata> for RunReport {
    fn from(metadata: &RunMetadata) -> Self {
        if metadata.is_empty() {
            return RunReport::Unknown;
        }
        match metadata.status {
            RunStatus::Initialized => RunReport::Initialized,
            RunStatus::Ready => RunReport::Ready,
            RunStatus::Scanning | RunStatus::Aggregating | RunStatus::Exporting => {
                RunReport::InProgress(metadata.current_stage)
            }
            RunStatus::Completed => RunReport::Completed,
            RunStatus::Failed => RunReport::Failed(
                metadata
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunReport::Unknown => write!(f, "CORRUPT"),
            RunReport::Initialized => write!(f, "INITIALIZED"),
            RunReport::Ready => write!(f, "READY"),
            RunReport::InProgress(stage) => write!(f, "IN PROGRESS ({})", stage),
            RunReport::Completed => write!(f, "COMPLETED"),
            RunReport::Failed(reason) => write!(f, "FAILED: {}", reason),
        }
    }
}

/// `list-runs` 使用的一行摘要
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub pipeline_name: String,
    pub run_id: String,
    pub report: RunReport,
    pub page_count: usize,
    pub created_at: Option<DateTime<Utc>>,
}
