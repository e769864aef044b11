use crate::error::{PipelineError, PipelineResult};
use serde_json::Value;
use std::path::Path;
use tokio::fs;

/// 从文件加载表格元数据 schema
///
/// 支持 `.json` 和 `.toml`，其余扩展名按 TOML 解析。
/// schema 必须是包含非空 `fields` 数组的对象
pub async fn load_metadata_schema(schema_path: &Path) -> PipelineResult<Value> {
    let content = fs::read_to_string(schema_path)
        .await
        .map_err(|e| PipelineError::io(schema_path, e))?;

    let is_json = schema_path.extension().and_then(|s| s.to_str()) == Some("json");

    let schema: Value = if is_json {
        serde_json::from_str(&content).map_err(|e| PipelineError::corrupt(schema_path, e))?
    } else {
        let parsed: toml::Value =
            toml::from_str(&content).map_err(|e| PipelineError::corrupt(schema_path, e))?;
        serde_json::to_value(parsed).map_err(|e| PipelineError::corrupt(schema_path, e))?
    };

    validate_schema(&schema).map_err(|reason| PipelineError::corrupt(schema_path, reason))?;

    tracing::info!(
        "已加载元数据 schema: {}",
        schema_path.file_name().unwrap_or_default().to_string_lossy()
    );

    Ok(schema)
}

fn validate_schema(schema: &Value) -> Result<(), String> {
    match schema.get("fields") {
        Some(Value::Array(fields)) if !fields.is_empty() => {
            for (index, field) in fields.iter().enumerate() {
                if field.get("name").and_then(Value::as_str).is_none() {
                    return Err(format!("fields[{}] 缺少 name", index));
                }
            }
            Ok(())
        }
        Some(Value::Array(_)) => Err("fields 不能为空".to_string()),
        _ => Err("schema 缺少 fields 数组".to_string()),
    }
}
