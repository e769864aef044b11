//! Run Store - 基础设施层
//!
//! 唯一持有文件系统布局的模块，其他层只通过这里读写运行数据：
//!
//! ```text
//! <base>/<pipeline_name>/<run_id>/
//!   metadata.json
//!   input/<original_filename>
//!   input/pages/page_<n>.<ext>
//!   intermediate/page_<n>.json
//!   aggregated/tables.json
//!   output/<sanitized_name>.csv
//! ```
//!
//! 删除操作是递归删除，不是事务性的

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{AggregatedTables, PageResult, RunMetadata};

pub const METADATA_FILE: &str = "metadata.json";
pub const INPUT_DIR: &str = "input";
pub const PAGES_DIR: &str = "pages";
pub const INTERMEDIATE_DIR: &str = "intermediate";
pub const AGGREGATED_DIR: &str = "aggregated";
pub const AGGREGATED_FILE: &str = "tables.json";
pub const OUTPUT_DIR: &str = "output";

/// 基于目录的运行存储
#[derive(Debug, Clone)]
pub struct RunStore {
    base_path: PathBuf,
}

impl RunStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn pipeline_path(&self, pipeline_name: &str) -> PathBuf {
        self.base_path.join(pipeline_name)
    }

    pub fn run_path(&self, pipeline_name: &str, run_id: &str) -> PathBuf {
        self.pipeline_path(pipeline_name).join(run_id)
    }

    pub fn pages_dir(&self, pipeline_name: &str, run_id: &str) -> PathBuf {
        self.run_path(pipeline_name, run_id)
            .join(INPUT_DIR)
            .join(PAGES_DIR)
    }

    pub fn intermediate_path(&self, pipeline_name: &str, run_id: &str, page_num: usize) -> PathBuf {
        self.run_path(pipeline_name, run_id)
            .join(INTERMEDIATE_DIR)
            .join(format!("page_{}.json", page_num))
    }

    pub fn aggregated_path(&self, pipeline_name: &str, run_id: &str) -> PathBuf {
        self.run_path(pipeline_name, run_id)
            .join(AGGREGATED_DIR)
            .join(AGGREGATED_FILE)
    }

    fn metadata_path(&self, pipeline_name: &str, run_id: &str) -> PathBuf {
        self.run_path(pipeline_name, run_id).join(METADATA_FILE)
    }

    /// 运行目录是否存在
    ///
    /// 名称不合法时视为不存在
    pub async fn run_exists(&self, pipeline_name: &str, run_id: &str) -> bool {
        if validate_run(pipeline_name, run_id).is_err() {
            return false;
        }
        fs::metadata(self.run_path(pipeline_name, run_id))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    // ========== 创建 ==========

    /// 创建运行目录和初始记录（INITIALIZED）
    ///
    /// 未指定 `run_id` 时生成 UUID v4。
    /// 目录已存在且非空时返回 `AlreadyExists`，已存在的空目录会被复用
    pub async fn create_run(&self, pipeline_name: &str, run_id: Option<&str>) -> PipelineResult<String> {
        validate_segment(pipeline_name)?;
        let run_id = match run_id {
            Some(id) => {
                validate_segment(id)?;
                id.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };

        let run_path = self.run_path(pipeline_name, &run_id);
        if !is_empty_or_missing(&run_path).await? {
            return Err(PipelineError::AlreadyExists {
                path: run_path.display().to_string(),
            });
        }

        for dir in [INPUT_DIR, INTERMEDIATE_DIR, AGGREGATED_DIR, OUTPUT_DIR] {
            let path = run_path.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| PipelineError::io(&path, e))?;
        }

        let metadata = RunMetadata::initialized(pipeline_name, &run_id);
        self.save_metadata(pipeline_name, &run_id, &metadata).await?;

        info!(
            "运行 '{}/{}' 已初始化: {}",
            pipeline_name,
            run_id,
            run_path.display()
        );
        Ok(run_id)
    }

    /// 复制输入文件到 input/，不校验文件内容
    pub async fn save_input_file(
        &self,
        pipeline_name: &str,
        run_id: &str,
        source_path: &Path,
        filename: &str,
    ) -> PipelineResult<PathBuf> {
        validate_run(pipeline_name, run_id)?;
        // 只保留文件名部分，防止跳出 input/
        let filename = Path::new(filename)
            .file_name()
            .ok_or_else(|| PipelineError::InvalidName(filename.to_string()))?;

        let input_dir = self.run_path(pipeline_name, run_id).join(INPUT_DIR);
        fs::create_dir_all(&input_dir)
            .await
            .map_err(|e| PipelineError::io(&input_dir, e))?;

        let dest_path = input_dir.join(filename);
        fs::copy(source_path, &dest_path)
            .await
            .map_err(|e| PipelineError::io(source_path, e))?;

        debug!("输入文件已保存: {}", dest_path.display());
        Ok(dest_path)
    }

    // ========== 运行记录 ==========

    /// 读取运行记录，文件不存在时返回空记录
    pub async fn load_metadata(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<RunMetadata> {
        let path = self.metadata_path(pipeline_name, run_id);
        Ok(read_json_opt(&path).await?.unwrap_or_default())
    }

    /// 整体覆盖写入运行记录
    pub async fn save_metadata(
        &self,
        pipeline_name: &str,
        run_id: &str,
        metadata: &RunMetadata,
    ) -> PipelineResult<()> {
        validate_run(pipeline_name, run_id)?;
        write_json(&self.metadata_path(pipeline_name, run_id), metadata).await
    }

    // ========== 中间结果 ==========

    /// 按页码覆盖写入单页结果
    pub async fn save_intermediate(
        &self,
        pipeline_name: &str,
        run_id: &str,
        page_num: usize,
        page: &PageResult,
    ) -> PipelineResult<()> {
        validate_run(pipeline_name, run_id)?;
        let path = self.intermediate_path(pipeline_name, run_id, page_num);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::io(parent, e))?;
        }
        write_json(&path, page).await
    }

    /// 按页码升序读取全部单页结果
    ///
    /// 不匹配 `page_<n>.json` 的文件被忽略；无法解析的文件返回 `CorruptData`
    pub async fn load_intermediates(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<Vec<PageResult>> {
        let dir = self.run_path(pipeline_name, run_id).join(INTERMEDIATE_DIR);
        let mut numbered = Vec::new();

        for path in list_dir(&dir).await? {
            let page_num = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_page_number);
            if let Some(page_num) = page_num {
                numbered.push((page_num, path));
            }
        }

        numbered.sort_by_key(|(page_num, _)| *page_num);

        let mut pages = Vec::with_capacity(numbered.len());
        for (page_num, path) in numbered {
            let mut page: PageResult = read_json_opt(&path)
                .await?
                .ok_or_else(|| PipelineError::not_found(path.display().to_string()))?;
            page.page_num = page_num;
            pages.push(page);
        }

        Ok(pages)
    }

    // ========== 聚合结果 ==========

    /// 整体覆盖写入聚合结果
    pub async fn save_aggregated(
        &self,
        pipeline_name: &str,
        run_id: &str,
        tables: &AggregatedTables,
    ) -> PipelineResult<()> {
        validate_run(pipeline_name, run_id)?;
        let path = self.aggregated_path(pipeline_name, run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::io(parent, e))?;
        }
        write_json(&path, tables).await
    }

    pub async fn load_aggregated(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<AggregatedTables> {
        let path = self.aggregated_path(pipeline_name, run_id);
        read_json_opt(&path)
            .await?
            .ok_or_else(|| PipelineError::not_found(path.display().to_string()))
    }

    /// 已保存的 tables.json 是否与 `tables` 逐字节相同，文件缺失时为 `NotFound`
    pub async fn aggregated_matches(
        &self,
        pipeline_name: &str,
        run_id: &str,
        tables: &AggregatedTables,
    ) -> PipelineResult<bool> {
        validate_run(pipeline_name, run_id)?;
        let path = self.aggregated_path(pipeline_name, run_id);
        let stored = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::not_found(path.display().to_string()))
            }
            Err(e) => return Err(PipelineError::io(&path, e)),
        };
        Ok(stored == render_json(&path, tables)?)
    }

    // ========== 输出 ==========

    /// 输出目录，按需创建
    pub async fn output_path(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<PathBuf> {
        validate_run(pipeline_name, run_id)?;
        let path = self.run_path(pipeline_name, run_id).join(OUTPUT_DIR);
        fs::create_dir_all(&path)
            .await
            .map_err(|e| PipelineError::io(&path, e))?;
        Ok(path)
    }

    /// 输出目录中的文件（按文件名排序）
    pub async fn list_output_files(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<Vec<PathBuf>> {
        let dir = self.run_path(pipeline_name, run_id).join(OUTPUT_DIR);
        let mut files = Vec::new();
        for path in list_dir(&dir).await? {
            if fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// 清空重新运行会覆盖的产物：分页、中间结果、聚合结果、输出
    pub async fn reset_artifacts(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<()> {
        validate_run(pipeline_name, run_id)?;
        let run_path = self.run_path(pipeline_name, run_id);
        for dir in [
            self.pages_dir(pipeline_name, run_id),
            run_path.join(INTERMEDIATE_DIR),
            run_path.join(AGGREGATED_DIR),
            run_path.join(OUTPUT_DIR),
        ] {
            remove_dir_if_exists(&dir).await?;
        }
        for dir in [INTERMEDIATE_DIR, AGGREGATED_DIR, OUTPUT_DIR] {
            let path = run_path.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| PipelineError::io(&path, e))?;
        }
        debug!("运行 '{}/{}' 的产物已清空", pipeline_name, run_id);
        Ok(())
    }

    /// 只清空中间结果目录
    pub async fn clear_intermediates(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<()> {
        validate_run(pipeline_name, run_id)?;
        let dir = self.run_path(pipeline_name, run_id).join(INTERMEDIATE_DIR);
        remove_dir_if_exists(&dir).await?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| PipelineError::io(&dir, e))
    }

    // ========== 枚举与清理 ==========

    pub async fn list_pipelines(&self) -> PipelineResult<Vec<String>> {
        list_subdirs(&self.base_path).await
    }

    pub async fn list_runs(&self, pipeline_name: &str) -> PipelineResult<Vec<String>> {
        validate_segment(pipeline_name)?;
        list_subdirs(&self.pipeline_path(pipeline_name)).await
    }

    /// 删除单个运行；流水线目录因此变空时一并删除
    pub async fn delete_run(&self, pipeline_name: &str, run_id: &str) -> PipelineResult<()> {
        validate_segment(pipeline_name)?;
        validate_segment(run_id)?;

        let run_path = self.run_path(pipeline_name, run_id);
        if !self.run_exists(pipeline_name, run_id).await {
            return Err(PipelineError::not_found(run_path.display().to_string()));
        }
        fs::remove_dir_all(&run_path)
            .await
            .map_err(|e| PipelineError::io(&run_path, e))?;

        // 非空时删除失败是正常情况
        let _ = fs::remove_dir(self.pipeline_path(pipeline_name)).await;

        info!("已删除运行 '{}/{}'", pipeline_name, run_id);
        Ok(())
    }

    pub async fn delete_pipeline(&self, pipeline_name: &str) -> PipelineResult<()> {
        validate_segment(pipeline_name)?;

        let path = self.pipeline_path(pipeline_name);
        if fs::metadata(&path).await.is_err() {
            return Err(PipelineError::not_found(path.display().to_string()));
        }
        fs::remove_dir_all(&path)
            .await
            .map_err(|e| PipelineError::io(&path, e))?;

        info!("已删除流水线 '{}' 及其全部运行", pipeline_name);
        Ok(())
    }

    /// 删除所有流水线，保留空的根目录
    pub async fn clear_all(&self) -> PipelineResult<()> {
        remove_dir_if_exists(&self.base_path).await?;
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| PipelineError::io(&self.base_path, e))?;

        info!("已清空全部流水线: {}", self.base_path.display());
        Ok(())
    }
}

/// 解析 `page_<n>.json` 中的页码
///
/// 只接受十进制数字且不带前导零，保证每个页码只对应一个文件名
pub fn parse_page_number(file_name: &str) -> Option<usize> {
    let digits = file_name.strip_prefix("page_")?.strip_suffix(".json")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) || digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

/// 写入运行目录前校验流水线名和运行 ID
fn validate_run(pipeline_name: &str, run_id: &str) -> PipelineResult<()> {
    validate_segment(pipeline_name)?;
    validate_segment(run_id)
}

/// 名称只能作为单级目录使用
fn validate_segment(name: &str) -> PipelineResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains('\0');
    if invalid {
        Err(PipelineError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

async fn is_empty_or_missing(dir: &Path) -> PipelineResult<bool> {
    match fs::read_dir(dir).await {
        Ok(mut entries) => Ok(entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::io(dir, e))?
            .is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(PipelineError::io(dir, e)),
    }
}

/// 目录内条目（按路径排序），目录不存在时为空
async fn list_dir(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PipelineError::io(dir, e)),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::io(dir, e))?
    {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

async fn list_subdirs(dir: &Path) -> PipelineResult<Vec<String>> {
    let mut names = Vec::new();
    for path in list_dir(dir).await? {
        if fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

async fn remove_dir_if_exists(dir: &Path) -> PipelineResult<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(dir, e)),
    }
}

/// 读取 JSON 文件，文件不存在时返回 `None`
async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> PipelineResult<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PipelineError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PipelineError::corrupt(path, e))
}

/// 落盘格式：缩进 JSON 加换行
fn render_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> PipelineResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| PipelineError::corrupt(path, e))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// 先写临时文件再重命名，避免进程中断留下半个 JSON
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> PipelineResult<()> {
    let bytes = render_json(path, value)?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &bytes)
        .await
        .map_err(|e| PipelineError::io(&tmp_path, e))?;
    fs::rename(&tmp_path, path)
        .await
        .map_err(|e| PipelineError::io(path, e))
}
