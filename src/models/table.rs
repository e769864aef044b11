use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// 一行单元格
pub type Row = Vec<String>;

/// 抽取服务返回的单张表（聚合前）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    #[serde(default)]
    pub id: String,
    #[serde(default = "untitled")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub columns: Vec<String>,
    /// 行长度不要求等于列数
    #[serde(default, deserialize_with = "null_as_empty")]
    pub rows: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: untitled(),
            columns: Vec::new(),
            rows: Vec::new(),
            metadata: None,
        }
    }
}

/// 单页抽取结果（intermediate/page_<n>.json）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    /// 页码以文件名为准，读取时由 Run Store 回填
    #[serde(default)]
    pub page_num: usize,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub raw_response: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PageResult {
    /// 抽取失败的页：不带任何表，只记录错误
    pub fn failed(page_num: usize, error: impl Into<String>) -> Self {
        Self {
            page_num,
            tables: Vec::new(),
            raw_response: String::new(),
            message: "Extraction failed".to_string(),
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// 参与聚合的表，失败页一张都不贡献
    pub fn contributing_tables(&self) -> &[Table] {
        if self.is_failed() {
            &[]
        } else {
            &self.tables
        }
    }
}

/// 跨页合并后的表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedTable {
    /// 首次出现时的原始名称
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    #[serde(default)]
    pub pages: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// CSV 片段模式下合并后的表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvTable {
    pub name: String,
    pub csv: String,
    #[serde(default)]
    pub pages: Vec<usize>,
}

/// aggregated/tables.json 的内容
///
/// 一次运行只会是其中一种，不会混合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregatedTables {
    Structured(Vec<AggregatedTable>),
    Csv(Vec<CsvTable>),
}

impl AggregatedTables {
    pub fn len(&self) -> usize {
        match self {
            AggregatedTables::Structured(tables) => tables.len(),
            AggregatedTables::Csv(tables) => tables.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<&str> {
        match self {
            AggregatedTables::Structured(tables) => tables.iter().map(|t| t.name.as_str()).collect(),
            AggregatedTables::Csv(tables) => tables.iter().map(|t| t.name.as_str()).collect(),
        }
    }
}

/// 导出的文件记录，每张合并表一条
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    pub table_name: String,
    pub file_path: PathBuf,
    pub metadata_path: Option<PathBuf>,
}

fn untitled() -> String {
    "Untitled".to_string()
}

/// `null` 与缺失字段一样按空处理
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
