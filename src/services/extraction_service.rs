//! 抽取服务 - 业务能力层
//!
//! 只负责"对单页文件调用识别服务，拿回原始文本"，不解析、不落盘
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 调用 OpenAI 兼容接口（Gemini / Azure / Doubao 等）
//! - 页面文件以 base64 data URL 的形式随消息发送
//! - 未配置 API Key 时使用 `MockExtractor`

use std::path::Path;
use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageDetail,
        ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};

/// 抽取服务能力
///
/// 给定单页文件和提示词，返回应当能解析为 `{"tables": [...]}` 的原始文本。
/// 超时和重试策略属于具体实现，编排层不做重试
#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn extract(
        &self,
        page_path: &Path,
        prompt: &str,
        metadata_schema: Option<&Value>,
    ) -> PipelineResult<String>;
}

/// 按配置构建抽取服务，没有 API Key 时退回 Mock
pub fn extractor_from_config(config: &Config) -> Arc<dyn ExtractionService> {
    if config.extraction_api_key.is_empty() {
        warn!("⚠️ 未配置 EXTRACTION_API_KEY，使用 Mock 抽取服务");
        Arc::new(MockExtractor::default())
    } else {
        Arc::new(OpenAiExtractor::new(config))
    }
}

/// 构建系统指令：输出格式约束 + 可选的元数据 schema + 用户请求
pub fn build_system_instruction(user_prompt: &str, metadata_schema: Option<&Value>) -> String {
    let mut instruction = String::from(
        "You are a document extraction assistant. \
         Analyze the uploaded document and extract all tables found. \
         Please provide your response in a strictly valid JSON format. \
         The JSON should contain a key 'tables' which is a list of table objects. \
         Each table object must have: \n\
          - 'id': a unique string identifier for the table\n\
          - 'name': a descriptive name for the table (inferred from context or title)\n\
          - 'columns': a list of strings representing the column headers\n\
          - 'rows': a list of lists of strings, representing the data rows matching the columns order. \n\
          - 'metadata': (Optional) a dictionary containing extracted metadata fields if specific \n\
             schema provided. \n",
    );

    if let Some(schema) = metadata_schema {
        let schema_str = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
        instruction.push_str(&format!(
            "\n\nPer Table Metadata Extraction:\n\
             For each table identified, you must also extract metadata based on the following schema:\n\
             {}\n\
             The extracted metadata should be placed in the 'metadata' key within each table object.\n",
            schema_str
        ));
    }

    instruction.push_str(&format!(
        "Do not include markdown code blocks (like ```json) in the response if possible, \
         or ensure it is valid JSON inside. \n\nUser Request: {}",
        user_prompt
    ));

    instruction
}

/// OpenAI 兼容接口的抽取服务
pub struct OpenAiExtractor {
    client: Client<OpenAIConfig>,
    model_name: String,
}

impl OpenAiExtractor {
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.extraction_api_key)
            .with_api_base(&config.extraction_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.extraction_model_name.clone(),
        }
    }

    /// 读取页面文件并编码成 data URL
    async fn page_data_url(page_path: &Path) -> PipelineResult<String> {
        let bytes = tokio::fs::read(page_path)
            .await
            .map_err(|e| PipelineError::io(page_path, e))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(format!("data:{};base64,{}", mime_type_for(page_path), encoded))
    }
}

#[async_trait]
impl ExtractionService for OpenAiExtractor {
    async fn extract(
        &self,
        page_path: &Path,
        prompt: &str,
        metadata_schema: Option<&Value>,
    ) -> PipelineResult<String> {
        debug!(
            "调用抽取服务，模型: {}，页面: {}",
            self.model_name,
            page_path.display()
        );

        let data_url = Self::page_data_url(page_path).await?;
        let instruction = build_system_instruction(prompt, metadata_schema);

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(instruction)
            .build()
            .map_err(PipelineError::external)?;

        let content_parts = vec![
            ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText {
                    text: prompt.to_string(),
                },
            ),
            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImage {
                    image_url: ImageUrl {
                        url: data_url,
                        detail: Some(ImageDetail::High),
                    },
                },
            ),
        ];
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
            .build()
            .map_err(PipelineError::external)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(0.0)
            .build()
            .map_err(PipelineError::external)?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("抽取服务调用失败: {}", e);
            PipelineError::external(e)
        })?;

        debug!("抽取服务调用成功");

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| PipelineError::external("抽取服务返回内容为空"))
    }
}

fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// 固定返回一张发票表的 Mock 抽取服务
#[derive(Debug, Clone)]
pub struct MockExtractor {
    response: String,
}

impl MockExtractor {
    pub const DEFAULT_RESPONSE: &'static str = r#"
{
  "tables": [
    {
      "id": "table_1",
      "name": "Invoice Items",
      "columns": ["Item", "Quantity", "Price"],
      "rows": [
        ["Widget A", "2", "$10.00"],
        ["Widget B", "1", "$25.00"]
      ]
    }
  ]
}
"#;

    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

impl Default for MockExtractor {
    fn default() -> Self {
        Self::with_response(Self::DEFAULT_RESPONSE)
    }
}

#[async_trait]
impl ExtractionService for MockExtractor {
    async fn extract(
        &self,
        page_path: &Path,
        _prompt: &str,
        _metadata_schema: Option<&Value>,
    ) -> PipelineResult<String> {
        debug!("Mock 抽取: {}", page_path.display());
        Ok(self.response.clone())
    }
}
