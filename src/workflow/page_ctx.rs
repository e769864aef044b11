//! 单页处理上下文
//!
//! 封装"我正在处理哪个运行的第几页"这一信息

use std::fmt::Display;

/// 单页处理上下文
#[derive(Debug, Clone)]
pub struct PageCtx {
    pub pipeline_name: String,
    pub run_id: String,
    /// 页码（从1开始）
    pub page_num: usize,
    /// 本次运行的总页数（仅用于日志显示）
    pub page_count: usize,
}

impl PageCtx {
    pub fn new(pipeline_name: &str, run_id: &str, page_num: usize, page_count: usize) -> Self {
        Self {
            pipeline_name: pipeline_name.to_string(),
            run_id: run_id.to_string(),
            page_num,
            page_count,
        }
    }
}

impl Display for PageCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[运行 {}/{} 第 {}/{} 页]",
            self.pipeline_name, self.run_id, self.page_num, self.page_count
        )
    }
}
