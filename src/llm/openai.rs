//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek 走同一实现，只换 base_url 与模型名。
//! 同一客户端也承担截图的视觉描述（多模态模型，图片以 data URL 发送）。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestMessageContentPartImageArgs, ChatCompletionRequestMessageContentPartTextArgs,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, ImageDetail, ImageUrlArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};

use crate::config::LlmSection;
use crate::llm::{LlmClient, LlmError, Message, MockLlmClient, RetryConfig, RetryingLlmClient, Role};
use crate::perception::{RawPage, VisionDescriber};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

const VISION_PROMPT: &str = "Describe this screenshot of a web page for an automation agent in at most five sentences. Mention open dialogs, error or status messages, and anything covering the page that would block clicking or typing.";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名，complete 时转 Message 为 API 格式并取首条 content
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        Self {
            client: Client::with_config(openai_config(base_url, api_key)),
            model: model.to_string(),
            usage: TokenUsage::default(),
        }
    }

    /// DeepSeek（优先使用 DEEPSEEK_API_KEY）
    pub fn deepseek(model: Option<&str>) -> Self {
        let api_key = deepseek_key();
        let model = model.unwrap_or(DEEPSEEK_CHAT);
        Self::new(Some(DEEPSEEK_BASE_URL), model, api_key.as_deref())
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let msg = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                msg.map_err(|e| LlmError::ApiError(e.to_string()))
            })
            .collect()
    }
}

pub(crate) fn openai_config(base_url: Option<&str>, api_key: Option<&str>) -> OpenAIConfig {
    let api_key = api_key
        .map(String::from)
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .unwrap_or_else(|| "sk-placeholder".to_string());
    match base_url {
        Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
        None => OpenAIConfig::new().with_api_key(api_key),
    }
}

fn deepseek_key() -> Option<String> {
    std::env::var("DEEPSEEK_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
}

/// 把 SDK 错误归类；429 / rate limit 视为可重试
fn classify(err: impl std::fmt::Display) -> LlmError {
    let text = err.to_string();
    let lower = text.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        LlmError::RateLimited {
            retry_after_ms: None,
        }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        LlmError::Timeout
    } else {
        LlmError::ApiError(text)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages)?)
            .build()
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        let response = self.client.chat().create(request).await.map_err(classify)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

/// 按 [llm] 配置创建客户端（外层包重试）
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let inner: Arc<dyn LlmClient> = match cfg.provider.as_str() {
        "deepseek" => Arc::new(OpenAiClient::deepseek(Some(cfg.model.as_str()))),
        "mock" => Arc::new(MockLlmClient::new()),
        other => {
            if other != "openai" {
                tracing::warn!(provider = other, "unknown LLM provider, using openai-compatible client");
            }
            Arc::new(OpenAiClient::new(cfg.base_url.as_deref(), &cfg.model, None))
        }
    };
    Arc::new(RetryingLlmClient::new(inner, RetryConfig::from_config(cfg)))
}

/// 截图视觉描述：页面没有截图时返回错误，由 WorldView 构建降级为纯 DOM
pub struct OpenAiVisionDescriber {
    client: Client<OpenAIConfig>,
    model: String,
    pub usage: TokenUsage,
}

impl OpenAiVisionDescriber {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        Self {
            client: Client::with_config(openai_config(base_url, api_key)),
            model: model.to_string(),
            usage: TokenUsage::default(),
        }
    }
}

fn screenshot_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", BASE64_STANDARD.encode(png))
}

fn vision_request(
    model: &str,
    page: &RawPage,
    png: &[u8],
) -> Result<CreateChatCompletionRequest, OpenAIError> {
    let text = ChatCompletionRequestMessageContentPartTextArgs::default()
        .text(format!("{}\nURL: {}\nTitle: {}", VISION_PROMPT, page.url, page.title))
        .build()?;
    let image = ChatCompletionRequestMessageContentPartImageArgs::default()
        .image_url(
            ImageUrlArgs::default()
                .url(screenshot_data_url(png))
                .detail(ImageDetail::Low)
                .build()?,
        )
        .build()?;
    let parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![text.into(), image.into()];
    let user = ChatCompletionRequestUserMessageArgs::default()
        .content(parts)
        .build()?;
    CreateChatCompletionRequestArgs::default()
        .model(model)
        .messages(vec![ChatCompletionRequestMessage::User(user)])
        .build()
}

#[async_trait]
impl VisionDescriber for OpenAiVisionDescriber {
    async fn describe(&self, page: &RawPage) -> Result<String, String> {
        let png = page
            .screenshot
            .as_deref()
            .ok_or_else(|| "page has no screenshot".to_string())?;
        let request = vision_request(&self.model, page, png).map_err(|e| e.to_string())?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify(e).to_string())?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| "vision model returned no description".to_string())
    }
}

/// 按 [llm] 配置创建视觉描述器；model 通常来自 perception.vision_model
pub fn create_vision_from_config(cfg: &LlmSection, model: &str) -> Arc<dyn VisionDescriber> {
    match cfg.provider.as_str() {
        "deepseek" => Arc::new(OpenAiVisionDescriber::new(
            Some(DEEPSEEK_BASE_URL),
            model,
            deepseek_key().as_deref(),
        )),
        _ => Arc::new(OpenAiVisionDescriber::new(cfg.base_url.as_deref(), model, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        assert!(matches!(
            classify("HTTP 429 Too Many Requests"),
            LlmError::RateLimited { .. }
        ));
        assert_eq!(classify("request timed out"), LlmError::Timeout);
        assert!(matches!(classify("invalid api key"), LlmError::ApiError(_)));
    }

    #[test]
    fn test_vision_request_carries_screenshot_as_data_url() {
        let page = RawPage {
            url: "https://site.test/login".into(),
            title: "Sign in".into(),
            elements: Vec::new(),
            screenshot: Some(vec![0x89, b'P', b'N', b'G']),
        };
        let png = page.screenshot.clone().unwrap();
        let request = vision_request("gpt-4o-mini", &page, &png).unwrap();
        let json = serde_json::to_value(&request).unwrap();
        let content = &json["messages"][0]["content"];
        assert_eq!(content[0]["type"], "text");
        assert!(content[0]["text"].as_str().unwrap().contains("Sign in"));
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,iVBORw==");
    }

    #[tokio::test]
    async fn test_vision_without_screenshot_errors_before_calling_api() {
        let describer = OpenAiVisionDescriber::new(Some("http://127.0.0.1:9"), "gpt-4o-mini", Some("sk-test"));
        let err = describer.describe(&RawPage::default()).await.unwrap_err();
        assert!(err.contains("no screenshot"));
    }
}
