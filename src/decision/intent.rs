//! 意图识别：COMMAND 或 QUESTION
//!
//! 先走快速规则（不调用 LLM），不确定时交给 LLM；LLM 不可用或失败时按 COMMAND 处理。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::{LlmClient, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// 要求在页面上执行操作
    Command,
    /// 提问，走知识问答
    Question,
}

const POLITE_PREFIXES: &[&str] = &["please", "can you", "could you", "would you", "请", "帮我"];

const QUESTION_PREFIXES: &[&str] = &[
    "how", "what", "why", "where", "when", "who", "which", "is there", "are there", "does",
    "can i", "should i", "如何", "怎么", "什么", "为什么", "哪",
];

const COMMAND_PREFIXES: &[&str] = &[
    "log", "sign", "click", "type", "enter", "fill", "open", "go", "navigate", "submit",
    "create", "press", "select", "search", "find", "登录", "点击", "输入", "打开", "填写", "提交",
];

pub struct IntentClassifier {
    llm: Option<Arc<dyn LlmClient>>,
}

impl IntentClassifier {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    /// 识别意图；`recent` 为最近几条用户输入（旧到新）
    pub async fn classify(&self, utterance: &str, recent: &[String]) -> Intent {
        if let Some(intent) = fast_match(utterance) {
            return intent;
        }
        let Some(llm) = &self.llm else {
            return Intent::Command;
        };
        match self.llm_classify(llm.as_ref(), utterance, recent).await {
            Ok(intent) => intent,
            Err(e) => {
                tracing::warn!(error = %e, "intent classification failed, treating as command");
                Intent::Command
            }
        }
    }

    async fn llm_classify(
        &self,
        llm: &dyn LlmClient,
        utterance: &str,
        recent: &[String],
    ) -> Result<Intent, String> {
        let system_prompt = r#"You classify what a user wants from a web automation assistant.

Output ONLY one word:
- command: the user wants something done on the web page (click, fill, navigate, log in, create ...)
- question: the user is asking for information or an explanation

Output format: just the word, nothing else."#;

        let mut prompt = String::new();
        if !recent.is_empty() {
            prompt.push_str("Earlier user messages:\n");
            for r in recent {
                prompt.push_str(&format!("- {}\n", r));
            }
        }
        prompt.push_str(&format!("User input: {}", utterance));

        let messages = vec![Message::system(system_prompt), Message::user(prompt)];
        let response = llm.complete(&messages).await.map_err(|e| e.to_string())?;
        let word = response.trim().to_lowercase();
        if word.starts_with("question") {
            Ok(Intent::Question)
        } else if word.starts_with("command") {
            Ok(Intent::Command)
        } else {
            Err(format!("unexpected classifier output: {}", word))
        }
    }
}

/// 快速规则：礼貌请求 → 命令；问句 → 问题；祈使动词 → 命令
fn fast_match(input: &str) -> Option<Intent> {
    let lower = input.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    if POLITE_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return Some(Intent::Command);
    }
    if lower.ends_with('?')
        || lower.ends_with('？')
        || lower.ends_with('吗')
        || starts_with_word(&lower, QUESTION_PREFIXES)
    {
        return Some(Intent::Question);
    }
    if starts_with_word(&lower, COMMAND_PREFIXES) {
        return Some(Intent::Command);
    }
    None
}

/// 前缀匹配且后面是词边界（中文前缀不要求边界）
fn starts_with_word(text: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| {
        text.strip_prefix(p).is_some_and(|rest| {
            !p.is_ascii() || rest.chars().next().map_or(true, |c| !c.is_alphanumeric())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};

    #[test]
    fn test_fast_match() {
        assert_eq!(fast_match("How do I reset my password?"), Some(Intent::Question));
        assert_eq!(fast_match("what is this page"), Some(Intent::Question));
        assert_eq!(fast_match("Log in with username=alice"), Some(Intent::Command));
        assert_eq!(fast_match("Can you open settings?"), Some(Intent::Command));
        assert_eq!(fast_match("如何重置密码"), Some(Intent::Question));
        assert_eq!(fast_match("howdy partner"), None);
        assert_eq!(fast_match("alice"), None);
    }

    #[tokio::test]
    async fn test_llm_fallback() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_response("question");
        let classifier = IntentClassifier::new(Some(mock.clone()));
        assert_eq!(classifier.classify("the reset flow", &[]).await, Intent::Question);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_llm_failure_defaults_to_command() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Timeout);
        let classifier = IntentClassifier::new(Some(mock));
        assert_eq!(classifier.classify("alice", &[]).await, Intent::Command);
        assert_eq!(IntentClassifier::new(None).classify("alice", &[]).await, Intent::Command);
    }
}
