//! 导出服务 - 业务能力层
//!
//! 把合并后的表写成 `output/<名称>.csv`，带元数据的表另写 `<名称>.metadata.json`。
//! 每张表都会尝试，一张失败不影响其余的表

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{AggregatedTables, ExportRecord};
use crate::services::csv_fragments::render_csv;

/// 清洗文件名：转小写，空格变下划线，只保留 `[A-Za-z0-9_-]`
pub fn sanitize_file_stem(name: &str) -> String {
    let stem: String = name
        .to_lowercase()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();

    if stem.is_empty() {
        "untitled".to_string()
    } else {
        stem
    }
}

/// 为每个名称分配不冲突的文件名，后出现的冲突依次加 `_2`、`_3`
pub fn assign_file_stems<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut used = HashSet::new();
    let mut stems = Vec::new();

    for name in names {
        let base = sanitize_file_stem(name);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while used.contains(&candidate) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        used.insert(candidate.clone());
        stems.push(candidate);
    }

    stems
}

/// 待写出的一张表
struct PendingExport<'a> {
    name: &'a str,
    csv: PipelineResult<String>,
    metadata: Option<&'a Map<String, Value>>,
}

/// CSV 导出器
#[derive(Debug, Clone, Copy)]
pub struct Exporter {
    /// 严格模式下任意一张表失败都会让导出阶段失败
    strict: bool,
}

impl Default for Exporter {
    fn default() -> Self {
        Self { strict: true }
    }
}

impl Exporter {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// 导出所有表到 `output_dir`，返回成功写出的文件
    pub async fn export(
        &self,
        tables: &AggregatedTables,
        output_dir: &Path,
    ) -> PipelineResult<Vec<ExportRecord>> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| PipelineError::io(output_dir, e))?;

        let pending = Self::pending_exports(tables);
        let stems = assign_file_stems(pending.iter().map(|p| p.name));

        let mut records = Vec::with_capacity(pending.len());
        let mut failed = Vec::new();

        for (item, stem) in pending.into_iter().zip(stems) {
            match Self::write_one(item.csv, item.metadata, output_dir, &stem).await {
                Ok((file_path, metadata_path)) => {
                    info!("📄 导出表 {} -> {}", item.name, file_path.display());
                    records.push(ExportRecord {
                        table_name: item.name.to_string(),
                        file_path,
                        metadata_path,
                    });
                }
                Err(e) => {
                    warn!("❌ 导出表 {} 失败: {}", item.name, e);
                    failed.push(item.name.to_string());
                }
            }
        }

        if !failed.is_empty() {
            if self.strict {
                return Err(PipelineError::ExportFailed { failed });
            }
            warn!("⚠️ 非严格模式，忽略 {} 张导出失败的表", failed.len());
        }

        Ok(records)
    }

    fn pending_exports(tables: &AggregatedTables) -> Vec<PendingExport<'_>> {
        match tables {
            AggregatedTables::Structured(tables) => tables
                .iter()
                .map(|t| PendingExport {
                    name: &t.name,
                    csv: render_csv(&t.columns, &t.rows).map_err(|source| PipelineError::Csv {
                        table: t.name.clone(),
                        source,
                    }),
                    metadata: t.metadata.as_ref(),
                })
                .collect(),
            AggregatedTables::Csv(tables) => tables
                .iter()
                .map(|t| PendingExport {
                    name: &t.name,
                    csv: Ok(t.csv.clone()),
                    metadata: None,
                })
                .collect(),
        }
    }

    async fn write_one(
        csv: PipelineResult<String>,
        metadata: Option<&Map<String, Value>>,
        output_dir: &Path,
        stem: &str,
    ) -> PipelineResult<(PathBuf, Option<PathBuf>)> {
        let content = csv?;
        let file_path = output_dir.join(format!("{}.csv", stem));
        tokio::fs::write(&file_path, content)
            .await
            .map_err(|e| PipelineError::io(&file_path, e))?;

        let metadata_path = match metadata {
            Some(metadata) => {
                let path = output_dir.join(format!("{}.metadata.json", stem));
                let mut json = serde_json::to_string_pretty(metadata)?;
                json.push('\n');
                tokio::fs::write(&path, json)
                    .await
                    .map_err(|e| PipelineError::io(&path, e))?;
                Some(path)
            }
            None => None,
        };

        Ok((file_path, metadata_path))
    }
}
