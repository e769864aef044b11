//! 跨页表格合并 - 业务能力层
//!
//! 纯函数：输入按页码排好序的 `PageResult`，输出去重合并后的表列表。
//! 相同输入总是得到相同输出，因此重复聚合会写出完全相同的 tables.json
//!
//! 合并键是规范化名称（去首尾空白 + 小写），分组按首次出现顺序输出，
//! 组名和列取首次出现的那张表

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{AggregatedTable, AggregatedTables, PageResult, Table};
use crate::services::csv_fragments;

/// 合并策略，系统配置时选定，一次运行只用一种
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// 只按名称合并，不检查列是否一致
    #[default]
    ByName,
    /// 名称相同且列一致（忽略大小写和空白）才合并，否则另起一组
    ByNameAndColumns,
    /// 以 CSV 文本片段合并，后续片段去掉表头行
    CsvFragments,
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" | "by_name" => Ok(MergePolicy::ByName),
            "name_columns" | "by_name_and_columns" => Ok(MergePolicy::ByNameAndColumns),
            "csv" | "csv_fragments" => Ok(MergePolicy::CsvFragments),
            other => Err(format!("未知的合并策略: {}", other)),
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergePolicy::ByName => "by_name",
            MergePolicy::ByNameAndColumns => "by_name_and_columns",
            MergePolicy::CsvFragments => "csv_fragments",
        };
        f.write_str(name)
    }
}

/// 规范化名称：去首尾空白后转小写
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// 按策略聚合
pub fn aggregate(pages: &[PageResult], policy: MergePolicy) -> AggregatedTables {
    match policy {
        MergePolicy::ByName => AggregatedTables::Structured(merge_tables(pages, false)),
        MergePolicy::ByNameAndColumns => AggregatedTables::Structured(merge_tables(pages, true)),
        MergePolicy::CsvFragments => AggregatedTables::Csv(csv_fragments::merge_csv_fragments(
            &csv_fragments::fragments_from_pages(pages),
        )),
    }
}

/// 结构化合并
///
/// 失败页不贡献任何表；`rows` 按页码升序、页内顺序拼接
pub fn merge_tables(pages: &[PageResult], require_matching_columns: bool) -> Vec<AggregatedTable> {
    let mut groups: Vec<AggregatedTable> = Vec::new();
    // 规范化名称 -> 该名称下的分组下标（按列区分时可能有多个）
    let mut index: HashMap<String, Vec<usize>> = HashMap::new();

    for page in pages {
        for table in page.contributing_tables() {
            let key = normalize_name(&table.name);
            let candidates = index.entry(key).or_default();

            let existing = candidates.iter().copied().find(|&i| {
                !require_matching_columns || columns_match(&groups[i].columns, &table.columns)
            });

            let group_index = match existing {
                Some(i) => i,
                None => {
                    groups.push(new_group(table));
                    candidates.push(groups.len() - 1);
                    groups.len() - 1
                }
            };

            let group = &mut groups[group_index];
            group.rows.extend(table.rows.iter().cloned());
            if group.pages.last() != Some(&page.page_num) {
                group.pages.push(page.page_num);
            }
        }
    }

    groups
}

fn new_group(table: &Table) -> AggregatedTable {
    AggregatedTable {
        name: table.name.clone(),
        columns: table.columns.clone(),
        rows: Vec::new(),
        pages: Vec::new(),
        id: (!table.id.is_empty()).then(|| table.id.clone()),
        metadata: table.metadata.clone(),
    }
}

/// 列名逐个比较，忽略大小写和首尾空白
pub fn columns_match(left: &[String], right: &[String]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right)
            .all(|(l, r)| normalize_name(l) == normalize_name(r))
}
