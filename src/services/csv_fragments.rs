//! CSV 片段合并
//!
//! 每页的每张表先渲染成 CSV 文本片段，再按规范化名称拼接：
//! 第一个片段完整保留，后续带表头的片段去掉首行；
//! 没有表头的片段（跨页续表）整体追加。去掉表头后什么都不剩的片段直接丢弃

use std::collections::HashMap;

use tracing::warn;

use crate::models::{CsvTable, PageResult, Row, Table};
use crate::services::aggregator::normalize_name;

/// 单页单表的 CSV 文本
#[derive(Debug, Clone, PartialEq)]
pub struct CsvFragment {
    pub name: String,
    pub csv: String,
    pub page: usize,
    /// 首行是否为表头
    pub has_header: bool,
}

/// 把一张表渲染成 CSV 文本，列非空时先写表头
///
/// 行长度不做校验，短行长行原样写出
pub fn table_to_csv(table: &Table) -> Result<String, csv::Error> {
    render_csv(&table.columns, &table.rows)
}

/// 渲染列和行，导出器对合并后的表也走这里
pub fn render_csv(columns: &[String], rows: &[Row]) -> Result<String, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());

    if !columns.is_empty() {
        writer.write_record(columns)?;
    }
    for row in rows {
        writer.write_record(row)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// 从页结果生成片段，失败页不贡献
pub fn fragments_from_pages(pages: &[PageResult]) -> Vec<CsvFragment> {
    let mut fragments = Vec::new();
    for page in pages {
        for table in page.contributing_tables() {
            match table_to_csv(table) {
                Ok(csv) => fragments.push(CsvFragment {
                    name: table.name.clone(),
                    csv,
                    page: page.page_num,
                    has_header: !table.columns.is_empty(),
                }),
                Err(e) => warn!("⚠️ 第 {} 页表 {} 渲染 CSV 失败: {}", page.page_num, table.name, e),
            }
        }
    }
    fragments
}

/// 按规范化名称合并片段，分组按首次出现顺序输出
pub fn merge_csv_fragments(fragments: &[CsvFragment]) -> Vec<CsvTable> {
    let mut merged: Vec<CsvTable> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for fragment in fragments {
        let key = normalize_name(&fragment.name);

        let i = match index.get(&key).copied() {
            Some(i) => i,
            None => {
                index.insert(key, merged.len());
                merged.push(CsvTable {
                    name: fragment.name.clone(),
                    csv: fragment.csv.clone(),
                    pages: vec![fragment.page],
                });
                continue;
            }
        };

        let body = if fragment.has_header {
            drop_first_line(&fragment.csv)
        } else {
            fragment.csv.as_str()
        };
        if body.is_empty() {
            continue;
        }

        let table = &mut merged[i];
        if !table.csv.is_empty() && !table.csv.ends_with('\n') {
            table.csv.push('\n');
        }
        table.csv.push_str(body);
        if table.pages.last() != Some(&fragment.page) {
            table.pages.push(fragment.page);
        }
    }

    merged
}

fn drop_first_line(text: &str) -> &str {
    match text.split_once('\n') {
        Some((_, rest)) => rest,
        None => "",
    }
}
