//! 知识库向量检索的嵌入后端
//!
//! 与对话模型共用 OpenAI 兼容配置；拿不到可用的 key 时不创建，知识库只做关键词检索。

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::openai::openai_config;

/// 文本 → 向量
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

/// `/embeddings` 端点
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAIConfig, model: impl Into<String>) -> Self {
        Self {
            client: Client::with_config(config),
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.as_str())
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| e.to_string())?;
        let mut response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;
        if response.data.is_empty() {
            return Err(format!("model {} returned no embedding", self.model));
        }
        Ok(response.data.swap_remove(0).embedding)
    }
}

/// 空值与占位 key 视为未配置
fn usable_key(key: Option<String>) -> Option<String> {
    key.map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty() && k != "sk-placeholder")
}

/// 按 `[llm]` 配置创建嵌入后端；OPENAI_API_KEY 不可用时返回 None
pub fn create_embedder_from_config(
    base_url: Option<&str>,
    model: &str,
) -> Option<Arc<dyn EmbeddingProvider>> {
    let Some(key) = usable_key(std::env::var("OPENAI_API_KEY").ok()) else {
        tracing::debug!("embedding skipped: no OPENAI_API_KEY");
        return None;
    };
    let config = openai_config(base_url, Some(&key));
    Some(Arc::new(OpenAiEmbedder::new(config, model)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_key_is_not_usable() {
        assert_eq!(usable_key(None), None);
        assert_eq!(usable_key(Some("  ".into())), None);
        assert_eq!(usable_key(Some("sk-placeholder".into())), None);
        assert_eq!(usable_key(Some(" sk-live ".into())).as_deref(), Some("sk-live"));
    }

    #[tokio::test]
    async fn test_blank_text_skips_the_api() {
        let embedder = OpenAiEmbedder::new(openai_config(Some("http://127.0.0.1:9"), Some("k")), "m");
        assert_eq!(embedder.embed("   ").await.unwrap(), Vec::<f32>::new());
    }
}
