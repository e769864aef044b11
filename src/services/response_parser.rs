//! 抽取响应解析 - 业务能力层
//!
//! 把抽取服务返回的原始文本解析成强类型的 `Table` 列表。
//! 解析失败不是错误：返回零张表和一条说明消息

use regex::Regex;
use serde_json::{Map, Value};

use crate::models::{Row, Table};

pub const PARSE_OK_MESSAGE: &str = "Extraction complete";
pub const PARSE_FAILED_MESSAGE: &str = "Failed to parse JSON response";
pub const PROCESSING_FAILED_MESSAGE: &str = "Error processing extracted data";

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedExtraction {
    pub tables: Vec<Table>,
    pub message: String,
}

impl ParsedExtraction {
    fn failed(message: String) -> Self {
        Self {
            tables: Vec::new(),
            message,
        }
    }
}

/// 解析抽取服务的原始响应
///
/// 接受 `{"tables": [...]}` 或直接的数组，允许外层包裹 ```json 代码块
pub fn parse_extraction_response(raw_text: &str) -> ParsedExtraction {
    let json_str = strip_code_fence(raw_text);

    let data: Value = match serde_json::from_str(&json_str) {
        Ok(value) => value,
        Err(e) => return ParsedExtraction::failed(format!("{}: {}", PARSE_FAILED_MESSAGE, e)),
    };

    let raw_tables = match data {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("tables") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return ParsedExtraction::failed(format!(
                    "{}: `tables` is not an array",
                    PROCESSING_FAILED_MESSAGE
                ))
            }
        },
        _ => Vec::new(),
    };

    let mut tables = Vec::with_capacity(raw_tables.len());
    for (index, raw) in raw_tables.into_iter().enumerate() {
        match table_from_value(raw) {
            Ok(table) => tables.push(table),
            Err(reason) => {
                return ParsedExtraction::failed(format!(
                    "{}: table {}: {}",
                    PROCESSING_FAILED_MESSAGE, index, reason
                ))
            }
        }
    }

    ParsedExtraction {
        tables,
        message: PARSE_OK_MESSAGE.to_string(),
    }
}

/// 去掉模型有时会加上的 Markdown 代码块
fn strip_code_fence(raw_text: &str) -> String {
    let trimmed = raw_text.trim();
    if let Ok(re) = Regex::new(r"(?s)^```[A-Za-z]*\s*(.*?)\s*```$") {
        if let Some(captures) = re.captures(trimmed) {
            if let Some(inner) = captures.get(1) {
                return inner.as_str().to_string();
            }
        }
    }
    trimmed.to_string()
}

fn table_from_value(value: Value) -> Result<Table, String> {
    let mut map = match value {
        Value::Object(map) => map,
        other => return Err(format!("expected object, got {}", type_name(&other))),
    };

    let id = match map.remove("id") {
        Some(Value::Null) | None => String::new(),
        Some(other) => cell_to_string(other),
    };
    let name = match map.remove("name") {
        Some(Value::String(name)) => name,
        _ => "Untitled".to_string(),
    };
    let columns = match map.remove("columns") {
        Some(Value::Array(items)) => items.into_iter().map(cell_to_string).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => return Err(format!("columns must be an array, got {}", type_name(&other))),
    };
    let rows = match map.remove("rows") {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(row_from_value)
            .collect::<Result<Vec<Row>, String>>()?,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => return Err(format!("rows must be an array, got {}", type_name(&other))),
    };
    let metadata: Option<Map<String, Value>> = match map.remove("metadata") {
        Some(Value::Object(metadata)) => Some(metadata),
        _ => None,
    };

    Ok(Table {
        id,
        name,
        columns,
        rows,
        metadata,
    })
}

fn row_from_value(value: Value) -> Result<Row, String> {
    match value {
        Value::Array(cells) => Ok(cells.into_iter().map(cell_to_string).collect()),
        other => Err(format!("row must be an array, got {}", type_name(&other))),
    }
}

/// 单元格统一为字符串：`null` 为空串，数字等保留 JSON 文本
fn cell_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
