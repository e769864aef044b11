/// 日志工具模块
///
/// 提供日志格式化和输出的辅助函数
use std::fs;

use anyhow::Result;
use tracing::info;

/// 初始化日志文件，写入带时间戳的表头
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n文档表格抽取日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 记录程序启动信息
///
/// # 参数
/// - `pipelines_dir`: 运行根目录
/// - `max_concurrent`: 最大并发运行数
pub fn log_startup(pipelines_dir: &str, max_concurrent: usize) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 文档表格抽取流水线");
    info!("📁 运行目录: {}", pipelines_dir);
    info!("📊 最大并发运行数: {}", max_concurrent);
    info!("{}", "=".repeat(60));
}

/// 记录批量输入加载信息
pub fn log_documents_loaded(total: usize, max_concurrent: usize) {
    info!("✓ 找到 {} 个待处理的文档", total);
    info!("📋 最多同时执行 {} 个运行\n", max_concurrent);
}

/// 记录单个运行开始
pub fn log_run_start(pipeline_name: &str, run_id: &str, input: &str) {
    info!("\n{}", "─".repeat(60));
    info!("📄 开始运行 {}/{}", pipeline_name, run_id);
    info!("输入文件: {}", input);
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `success`: 成功数量
/// - `failed`: 失败数量
/// - `total`: 总数
/// - `log_file_path`: 日志文件路径（未配置时不打印）
pub fn print_final_stats(success: usize, failed: usize, total: usize, log_file_path: Option<&str>) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", success, total);
    info!("❌ 失败: {}", failed);
    info!("{}", "=".repeat(60));
    if let Some(path) = log_file_path {
        info!("\n日志已保存至: {}", path);
    }
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度（按字符计）
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
