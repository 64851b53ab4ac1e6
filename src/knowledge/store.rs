//! 内存知识库：关键词 + 可选向量的混合检索
//!
//! 两路结果用 RRF（Reciprocal Rank Fusion）合并；没有嵌入提供方时只走关键词。
//! 写入只发生在启动 / 测试阶段，检索期间只读。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::knowledge::tokenizer;
use crate::knowledge::{KnowledgeQuery, KnowledgeRetriever, Passage};
use crate::llm::EmbeddingProvider;

const RRF_K: f32 = 60.0;

#[derive(Debug, Clone)]
struct Entry {
    id: usize,
    text: String,
    source: String,
    embedding: Option<Vec<f32>>,
}

pub struct InMemoryKnowledgeStore {
    entries: RwLock<Vec<Entry>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl Default for InMemoryKnowledgeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            embedder: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// 添加一个段落；嵌入失败时仍以关键词方式收录
    pub async fn add_passage(&self, source: impl Into<String>, text: impl Into<String>) {
        let text = text.into();
        let embedding = match &self.embedder {
            Some(embedder) => match embedder.embed(&text).await {
                Ok(v) if !v.is_empty() => Some(v),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "embedding failed, passage indexed by keywords only");
                    None
                }
            },
            None => None,
        };
        let mut entries = self.entries.write().await;
        let id = entries.len();
        entries.push(Entry {
            id,
            text,
            source: source.into(),
            embedding,
        });
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn keyword_ranking(entries: &[Entry], query: &str) -> Vec<usize> {
        let q = tokenizer::tokenize_to_set(query);
        let mut scored: Vec<(f32, usize)> = entries
            .iter()
            .map(|e| {
                let t = tokenizer::tokenize_to_set(&e.text);
                (tokenizer::jaccard_similarity(&q, &t), e.id)
            })
            .filter(|(s, _)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, id)| id).collect()
    }

    fn vector_ranking(entries: &[Entry], query_vec: &[f32]) -> Vec<usize> {
        let mut scored: Vec<(f32, usize)> = entries
            .iter()
            .filter_map(|e| {
                e.embedding
                    .as_ref()
                    .map(|v| (cosine_similarity(query_vec, v), e.id))
            })
            .filter(|(s, _)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, id)| id).collect()
    }
}

#[async_trait]
impl KnowledgeRetriever for InMemoryKnowledgeStore {
    async fn retrieve(&self, query: &KnowledgeQuery) -> Result<Vec<Passage>, String> {
        let query_vec = match &self.embedder {
            Some(embedder) => Some(embedder.embed(&query.text).await?),
            None => None,
        };

        let entries = self.entries.read().await;
        let limit = query.top_k.max(1) * 2;
        let mut rankings = vec![Self::keyword_ranking(&entries, &query.text)];
        if let Some(v) = query_vec.filter(|v| !v.is_empty()) {
            rankings.push(Self::vector_ranking(&entries, &v));
        }

        let mut fused: HashMap<usize, f32> = HashMap::new();
        for ranking in &rankings {
            for (rank, id) in ranking.iter().take(limit).enumerate() {
                *fused.entry(*id).or_insert(0.0) += 1.0 / (RRF_K + rank as f32 + 1.0);
            }
        }

        let mut results: Vec<(usize, f32)> = fused.into_iter().collect();
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        results.truncate(query.top_k);

        Ok(results
            .into_iter()
            .filter_map(|(id, score)| {
                entries
                    .get(id)
                    .map(|e| Passage::new(e.text.clone(), score).with_source(e.source.clone()))
            })
            .collect())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
