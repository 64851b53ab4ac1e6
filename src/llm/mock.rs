//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预置的响应或错误；队列耗尽后返回默认响应（未设置时为 EmptyResponse）。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

/// 脚本化的 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    calls: AtomicUsize,
    last_user: Mutex<Option<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 队列耗尽后始终返回 `text`
    pub fn with_default(text: impl Into<String>) -> Self {
        Self {
            fallback: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn push_response(&self, text: impl Into<String>) {
        if let Ok(mut q) = self.script.lock() {
            q.push_back(Ok(text.into()));
        }
    }

    pub fn push_error(&self, err: LlmError) {
        if let Ok(mut q) = self.script.lock() {
            q.push_back(Err(err));
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 最近一次调用中的最后一条 User 消息
    pub fn last_user_message(&self) -> Option<String> {
        self.last_user.lock().ok().and_then(|g| g.clone())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_user.lock() {
            *last = messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone());
        }
        let next = self.script.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(r) => r,
            None => self.fallback.clone().ok_or(LlmError::EmptyResponse),
        }
    }
}
