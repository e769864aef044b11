//! 批量运行处理器 - 编排层
//!
//! ## 职责
//!
//! 把一个目录下的多个文档作为互相独立的运行并发执行。
//!
//! ## 核心功能
//!
//! 1. **批量加载**：扫描输入目录，得到待处理文档列表
//! 2. **并发控制**：使用 Semaphore 限制同时执行的运行数量
//! 3. **失败隔离**：一个运行失败不影响其他运行
//! 4. **全局统计**：汇总所有运行的结果
//!
//! 运行之间不共享任何可变状态，因此不需要加锁

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::error::{PipelineError, PipelineResult};
use crate::orchestrator::run_orchestrator::{RunOptions, RunOrchestrator};

/// 单个文档的处理结果
#[derive(Debug)]
pub struct BatchOutcome {
    pub input: PathBuf,
    /// 运行创建失败时为空
    pub run_id: Option<String>,
    pub error: Option<String>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 处理统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub success: usize,
    pub failed: usize,
    pub total: usize,
}

impl BatchStats {
    pub fn from_outcomes(outcomes: &[BatchOutcome]) -> Self {
        let success = outcomes.iter().filter(|o| o.is_success()).count();
        Self {
            success,
            failed: outcomes.len() - success,
            total: outcomes.len(),
        }
    }
}

/// 批量运行处理器
pub struct BatchRunner {
    orchestrator: RunOrchestrator,
    max_concurrent: usize,
}

impl BatchRunner {
    pub fn new(orchestrator: RunOrchestrator, max_concurrent: usize) -> Self {
        Self {
            orchestrator,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// 为每个输入创建一个运行并执行，结果顺序与输入一致
    pub async fn run_all(
        &self,
        pipeline_name: &str,
        inputs: Vec<PathBuf>,
        options: &RunOptions,
    ) -> Vec<BatchOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(inputs.len());

        for (idx, input) in inputs.into_iter().enumerate() {
            let doc_index = idx + 1;
            let semaphore = Arc::clone(&semaphore);
            let orchestrator = self.orchestrator.clone();
            let pipeline_name = pipeline_name.to_string();
            let options = options.clone();

            let handle = tokio::spawn(async move {
                // Semaphore 不会被关闭，acquire 失败时直接执行
                let _permit = semaphore.acquire_owned().await.ok();
                process_document(&orchestrator, &pipeline_name, input, &options, doc_index).await
            });
            handles.push(handle);
        }

        join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(idx, joined)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("[文档 {}] 任务执行失败: {}", idx + 1, e);
                    BatchOutcome {
                        input: PathBuf::new(),
                        run_id: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect()
    }
}

async fn process_document(
    orchestrator: &RunOrchestrator,
    pipeline_name: &str,
    input: PathBuf,
    options: &RunOptions,
    doc_index: usize,
) -> BatchOutcome {
    info!("[文档 {}] 📄 开始处理: {}", doc_index, input.display());

    let run_id = match orchestrator.create_run(pipeline_name, &input, None, None).await {
        Ok(run_id) => run_id,
        Err(e) => {
            error!("[文档 {}] ❌ 创建运行失败: {}", doc_index, e);
            return BatchOutcome {
                input,
                run_id: None,
                error: Some(e.to_string()),
            };
        }
    };

    let error = match orchestrator.run_stages(pipeline_name, &run_id, options).await {
        Ok(()) => {
            info!("[文档 {}] ✅ 运行 {} 完成", doc_index, run_id);
            None
        }
        Err(e) => {
            error!("[文档 {}] ❌ 运行 {} 失败: {}", doc_index, run_id, e);
            Some(e.to_string())
        }
    };

    BatchOutcome {
        input,
        run_id: Some(run_id),
        error,
    }
}

/// 输入目录下的文件（不递归，按文件名排序）
pub async fn collect_inputs(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| PipelineError::io(dir, e))?;

    let mut inputs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::io(dir, e))?
    {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        if is_file && !hidden {
            inputs.push(path);
        }
    }
    inputs.sort();
    Ok(inputs)
}
