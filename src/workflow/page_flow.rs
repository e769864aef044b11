//! 单页处理流程 - 流程层
//!
//! 核心职责：定义"一页"的完整处理流程
//!
//! 流程顺序：
//! 1. 调用抽取服务拿到原始文本
//! 2. 解析成表格
//! 3. 抽取服务出错时记录错误，不向上传播

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::models::PageResult;
use crate::services::{parse_extraction_response, ExtractionService};
use crate::utils::logging::truncate_text;
use crate::workflow::page_ctx::PageCtx;

/// 单页处理流程
///
/// - 不持有任何文件系统资源，落盘由编排层负责
/// - 只依赖业务能力（services）
pub struct PageFlow {
    extractor: Arc<dyn ExtractionService>,
    prompt: String,
    metadata_schema: Option<Value>,
    verbose_logging: bool,
}

impl PageFlow {
    pub fn new(
        extractor: Arc<dyn ExtractionService>,
        prompt: impl Into<String>,
        metadata_schema: Option<Value>,
        verbose_logging: bool,
    ) -> Self {
        Self {
            extractor,
            prompt: prompt.into(),
            metadata_schema,
            verbose_logging,
        }
    }

    /// 处理单页，失败也返回 `PageResult`（只带 `error`）
    pub async fn run(&self, page_path: &Path, ctx: &PageCtx) -> PageResult {
        info!("{} 🔍 正在抽取表格...", ctx);

        let raw = match self
            .extractor
            .extract(page_path, &self.prompt, self.metadata_schema.as_ref())
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!("{} ⚠️ 抽取失败，跳过本页: {}", ctx, e);
                return PageResult::failed(ctx.page_num, e.to_string());
            }
        };

        if self.verbose_logging {
            info!("{} 原始响应: {}", ctx, truncate_text(&raw, 200));
        }

        let parsed = parse_extraction_response(&raw);
        info!(
            "{} ✓ 抽取完成，找到 {} 张表 ({})",
            ctx,
            parsed.tables.len(),
            parsed.message
        );

        PageResult {
            page_num: ctx.page_num,
            tables: parsed.tables,
            raw_response: raw,
            message: parsed.message,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, PipelineResult};
    use crate::services::MockExtractor;
    use async_trait::async_trait;

    struct Unavailable;

    #[async_trait]
    impl ExtractionService for Unavailable {
        async fn extract(
            &self,
            _page_path: &Path,
            _prompt: &str,
            _metadata_schema: Option<&Value>,
        ) -> PipelineResult<String> {
            Err(PipelineError::external("503 Service Unavailable"))
        }
    }

    fn ctx(page_num: usize) -> PageCtx {
        PageCtx::new("invoices", "run-1", page_num, 3)
    }

    #[tokio::test]
    async fn successful_page_carries_tables_and_raw_text() {
        let flow = PageFlow::new(Arc::new(MockExtractor::default()), "Extract", None, true);

        let page = flow.run(Path::new("page_1.pdf"), &ctx(1)).await;

        assert_eq!(page.page_num, 1);
        assert!(!page.is_failed());
        assert_eq!(page.tables[0].name, "Invoice Items");
        assert!(page.raw_response.contains("Widget A"));
        assert_eq!(page.message, "Extraction complete");
    }

    #[tokio::test]
    async fn service_error_is_isolated_to_the_page() {
        let flow = PageFlow::new(Arc::new(Unavailable), "Extract", None, false);

        let page = flow.run(Path::new("page_2.pdf"), &ctx(2)).await;

        assert_eq!(page.page_num, 2);
        assert!(page.tables.is_empty());
        assert!(page.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn unparsable_response_is_not_an_error() {
        let flow = PageFlow::new(
            Arc::new(MockExtractor::with_response("no tables here")),
            "Extract",
            None,
            false,
        );

        let page = flow.run(Path::new("page_3.pdf"), &ctx(3)).await;

        assert!(!page.is_failed());
        assert!(page.tables.is_empty());
        assert!(page.message.starts_with("Failed to parse JSON response"));
    }

    #[test]
    fn ctx_display() {
        assert_eq!(ctx(2).to_string(), "[运行 invoices/run-1 第 2/3 页]");
    }
}
