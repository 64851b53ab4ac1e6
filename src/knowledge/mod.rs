//! 知识层：检索能力接口、融合、内存混合检索与问答
//!
//! 检索后端通过 `KnowledgeRetriever` 注入，决策引擎不关心具体实现。
//! KnowledgeContext 只属于单个回合，Step 上只保留 KnowledgeStatus。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod answer;
pub mod fuser;
pub mod store;
pub mod tokenizer;

pub use answer::{QuestionAnswerer, NO_KNOWLEDGE_ANSWER};
pub use fuser::{FusedKnowledge, KnowledgeFuser};
pub use store::InMemoryKnowledgeStore;

/// 检索到的段落
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub score: f32,
    pub source: Option<String>,
}

impl Passage {
    pub fn new(text: impl Into<String>, score: f32) -> Self {
        Self {
            text: text.into(),
            score,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// 单回合的检索上下文（按相关度降序）
#[derive(Debug, Clone, Default)]
pub struct KnowledgeContext {
    pub passages: Vec<Passage>,
}

impl KnowledgeContext {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn to_prompt_section(&self) -> String {
        let mut out = String::new();
        for (i, p) in self.passages.iter().enumerate() {
            out.push_str(&format!("[{}] (score {:.2}) {}\n", i + 1, p.score, p.text.trim()));
        }
        out
    }
}

/// 检索请求
#[derive(Debug, Clone)]
pub struct KnowledgeQuery {
    pub text: String,
    pub top_k: usize,
    pub objective: String,
}

/// 检索能力（外部协作方）
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn retrieve(&self, query: &KnowledgeQuery) -> Result<Vec<Passage>, String>;
}

/// Step 上记录的知识使用情况
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KnowledgeStatus {
    Disabled,
    Used { passages: usize },
    Empty,
    /// 检索失败，回合降级为只用 WorldView
    Unavailable { reason: String },
}

impl KnowledgeStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, KnowledgeStatus::Empty | KnowledgeStatus::Unavailable { .. })
    }
}
