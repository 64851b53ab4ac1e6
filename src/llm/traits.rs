//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient。
//! RetryingLlmClient 包装任意客户端，对超时与限流做指数退避重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("API error: {0}")]
    ApiError(String),

    #[error("empty response")]
    EmptyResponse,
}

impl LlmError {
    /// 超时与限流可重试；其他错误直接返回
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Timeout | LlmError::RateLimited { .. })
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试参数
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 单次请求超时
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn from_config(llm: &crate::config::LlmSection) -> Self {
        Self {
            max_retries: llm.max_retries,
            base_delay: Duration::from_millis(llm.base_delay_ms),
            request_timeout: Duration::from_secs(llm.request_timeout_secs.max(1)),
            ..Self::default()
        }
    }

    /// 第 attempt 次重试前的等待（attempt 从 1 开始）
    fn delay_for(&self, attempt: u32, err: &LlmError) -> Duration {
        if let LlmError::RateLimited {
            retry_after_ms: Some(ms),
        } = err
        {
            return Duration::from_millis(*ms).min(self.max_delay);
        }
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// 带超时与重试的包装客户端
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(
                self.config.request_timeout,
                self.inner.complete(messages),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(LlmError::Timeout),
            };
            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.delay_for(attempt, &e);
                    tracing::warn!(attempt, ?delay, error = %e, "LLM call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            request_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Timeout);
        mock.push_error(LlmError::RateLimited {
            retry_after_ms: Some(1),
        });
        mock.push_response("ok");
        let client = RetryingLlmClient::new(mock.clone(), fast());
        let out = client.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_api_error_not_retried() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::ApiError("bad key".into()));
        let client = RetryingLlmClient::new(mock.clone(), fast());
        let err = client.complete(&[Message::user("hi")]).await.unwrap_err();
        assert_eq!(err, LlmError::ApiError("bad key".into()));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mock = Arc::new(MockLlmClient::new());
        for _ in 0..5 {
            mock.push_error(LlmError::Timeout);
        }
        let client = RetryingLlmClient::new(mock.clone(), fast());
        assert!(client.complete(&[]).await.is_err());
        assert_eq!(mock.call_count(), 3);
    }
}
