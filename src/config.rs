use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};
use crate::services::MergePolicy;

/// 程序配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 所有流水线运行的根目录
    pub pipelines_dir: PathBuf,
    /// 未指定时使用的流水线名称
    pub default_pipeline: String,
    /// 未指定时使用的抽取提示词
    pub default_prompt: String,
    /// 批量模式下同时执行的运行数量
    pub max_concurrent_runs: usize,
    /// 跨页合并策略
    pub merge_policy: MergePolicy,
    /// 导出时任意一张表失败即判定导出阶段失败
    pub export_strict: bool,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 日志级别，`RUST_LOG` 优先
    pub log_level: String,
    /// 输出日志文件，不配置则不写
    pub output_log_file: Option<String>,
    // --- 抽取服务配置 ---
    pub extraction_api_key: String,
    pub extraction_api_base_url: String,
    pub extraction_model_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipelines_dir: PathBuf::from("pipelines"),
            default_pipeline: "default".to_string(),
            default_prompt: "Extract all tables.".to_string(),
            max_concurrent_runs: 4,
            merge_policy: MergePolicy::ByName,
            export_strict: true,
            verbose_logging: false,
            log_level: "info".to_string(),
            output_log_file: None,
            extraction_api_key: String::new(),
            extraction_api_base_url: "https://generativelanguage.googleapis.com/v1beta/openai"
                .to_string(),
            extraction_model_name: "gemini-2.0-flash".to_string(),
        }
    }
}

impl Config {
    /// 默认值 + 环境变量
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// TOML 文件 + 环境变量，文件中缺失的字段取默认值
    pub fn from_toml_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config.with_env_overrides())
    }

    /// 用环境变量覆盖已有的值，未设置或无法解析的变量保持原值
    pub fn with_env_overrides(self) -> Self {
        Self {
            pipelines_dir: std::env::var("PIPELINES_DIR").map(PathBuf::from).unwrap_or(self.pipelines_dir),
            default_pipeline: std::env::var("DEFAULT_PIPELINE").unwrap_or(self.default_pipeline),
            default_prompt: std::env::var("DEFAULT_PROMPT").unwrap_or(self.default_prompt),
            max_concurrent_runs: std::env::var("MAX_CONCURRENT_RUNS").ok().and_then(|v| v.parse().ok()).filter(|n| *n > 0).unwrap_or(self.max_concurrent_runs),
            merge_policy: std::env::var("MERGE_POLICY").ok().and_then(|v| v.parse().ok()).unwrap_or(self.merge_policy),
            export_strict: std::env::var("EXPORT_STRICT").ok().and_then(|v| v.parse().ok()).unwrap_or(self.export_strict),
            verbose_logging: std::env::var("VERBOSE_LOGGING").ok().and_then(|v| v.parse().ok()).unwrap_or(self.verbose_logging),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(self.log_level),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").ok().or(self.output_log_file),
            extraction_api_key: std::env::var("EXTRACTION_API_KEY")
                .or_else(|_| std::env::var("GOOGLE_API_KEY"))
                .unwrap_or(self.extraction_api_key),
            extraction_api_base_url: std::env::var("EXTRACTION_API_BASE_URL").unwrap_or(self.extraction_api_base_url),
            extraction_model_name: std::env::var("EXTRACTION_MODEL_NAME").unwrap_or(self.extraction_model_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_fields_fall_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            pipelines_dir = "/data/runs"
            merge_policy = "by_name_and_columns"
            export_strict = false
            "#,
        )
        .unwrap();

        assert_eq!(config.pipelines_dir, PathBuf::from("/data/runs"));
        assert_eq!(config.merge_policy, MergePolicy::ByNameAndColumns);
        assert!(!config.export_strict);
        assert_eq!(config.default_pipeline, "default");
        assert_eq!(config.max_concurrent_runs, 4);
    }

    #[test]
    fn bad_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc_tracer.toml");
        std::fs::write(&path, "max_concurrent_runs = \"many\"").unwrap();

        let err = Config::from_toml_file(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
