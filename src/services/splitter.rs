//! 文档拆分 - 业务能力层
//!
//! 只负责"把一个文档拆成按页的文件"，页码从 1 开始，与拆分顺序一致

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lopdf::Document;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

/// 文档拆分能力
pub trait DocumentSplitter: Send + Sync {
    /// 把 `input` 拆成单页文件写入 `pages_dir`，按页码顺序返回路径
    fn split(&self, input: &Path, pages_dir: &Path) -> PipelineResult<Vec<PathBuf>>;
}

/// PDF 拆分：每页写成一个单页 PDF
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfSplitter;

impl DocumentSplitter for PdfSplitter {
    fn split(&self, input: &Path, pages_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        let document = Document::load(input).map_err(|e| PipelineError::corrupt(input, e))?;
        std::fs::create_dir_all(pages_dir).map_err(|e| PipelineError::io(pages_dir, e))?;

        let page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
        let mut page_files = Vec::with_capacity(page_numbers.len());

        for (index, &page_number) in page_numbers.iter().enumerate() {
            let others: Vec<u32> = page_numbers
                .iter()
                .copied()
                .filter(|n| *n != page_number)
                .collect();

            let mut single = document.clone();
            single.delete_pages(&others);
            single.prune_objects();

            let path = pages_dir.join(format!("page_{}.pdf", index + 1));
            single
                .save(&path)
                .map_err(|e| PipelineError::io_message(&path, e))?;

            debug!("已拆分第 {} 页: {}", index + 1, path.display());
            page_files.push(path);
        }

        Ok(page_files)
    }
}

/// 非 PDF 输入（图片等）整体作为一页
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughSplitter;

impl DocumentSplitter for PassthroughSplitter {
    fn split(&self, input: &Path, pages_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        std::fs::create_dir_all(pages_dir).map_err(|e| PipelineError::io(pages_dir, e))?;

        let file_name = match input.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("page_1.{}", ext),
            None => "page_1".to_string(),
        };
        let path = pages_dir.join(file_name);
        std::fs::copy(input, &path).map_err(|e| PipelineError::io(input, e))?;

        Ok(vec![path])
    }
}

/// 按扩展名选择拆分方式
pub fn splitter_for(input: &Path) -> Arc<dyn DocumentSplitter> {
    let is_pdf = input
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);

    if is_pdf {
        Arc::new(PdfSplitter)
    } else {
        Arc::new(PassthroughSplitter)
    }
}
