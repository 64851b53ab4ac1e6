//! 知识融合：按目标与当前话语检索，失败或为空时降级
//!
//! 检索永远不会让回合失败，降级情况通过 KnowledgeStatus 记录在 Step 上。

use std::sync::Arc;

use crate::config::KnowledgeSection;
use crate::knowledge::{KnowledgeContext, KnowledgeQuery, KnowledgeRetriever, KnowledgeStatus};

/// 融合结果：上下文（有则并入决策）+ 状态（记录在 Step）
#[derive(Debug, Clone)]
pub struct FusedKnowledge {
    pub context: Option<KnowledgeContext>,
    pub status: KnowledgeStatus,
}

impl FusedKnowledge {
    pub fn disabled() -> Self {
        Self {
            context: None,
            status: KnowledgeStatus::Disabled,
        }
    }
}

pub struct KnowledgeFuser {
    retriever: Option<Arc<dyn KnowledgeRetriever>>,
    top_k: usize,
    min_score: f32,
}

impl KnowledgeFuser {
    pub fn new(retriever: Option<Arc<dyn KnowledgeRetriever>>, cfg: &KnowledgeSection) -> Self {
        Self {
            retriever,
            top_k: cfg.top_k.max(1),
            min_score: cfg.min_score,
        }
    }

    /// 查询文本 = 目标 + 当前话语 / 子目标
    pub fn build_query(&self, objective: &str, goal: Option<&str>) -> KnowledgeQuery {
        let text = match goal.map(str::trim).filter(|g| !g.is_empty()) {
            Some(g) if g != objective.trim() => format!("{}\n{}", objective.trim(), g),
            _ => objective.trim().to_string(),
        };
        KnowledgeQuery {
            text,
            top_k: self.top_k,
            objective: objective.to_string(),
        }
    }

    pub async fn fuse(&self, enabled: bool, objective: &str, goal: Option<&str>) -> FusedKnowledge {
        if !enabled {
            return FusedKnowledge::disabled();
        }
        self.run(self.build_query(objective, goal)).await
    }

    /// 问答路径：只用问题本身检索，目标作为附加信息传给检索方
    pub async fn fuse_question(&self, objective: &str, question: &str) -> FusedKnowledge {
        self.run(KnowledgeQuery {
            text: question.trim().to_string(),
            top_k: self.top_k,
            objective: objective.to_string(),
        })
        .await
    }

    async fn run(&self, query: KnowledgeQuery) -> FusedKnowledge {
        let Some(retriever) = &self.retriever else {
            return FusedKnowledge {
                context: None,
                status: KnowledgeStatus::Unavailable {
                    reason: "no knowledge retriever configured".to_string(),
                },
            };
        };

        match retriever.retrieve(&query).await {
            Ok(mut passages) => {
                passages.retain(|p| p.score >= self.min_score);
                passages.truncate(self.top_k);
                if passages.is_empty() {
                    tracing::debug!(query = %query.text, "knowledge retrieval returned nothing");
                    FusedKnowledge {
                        context: None,
                        status: KnowledgeStatus::Empty,
                    }
                } else {
                    let n = passages.len();
                    FusedKnowledge {
                        context: Some(KnowledgeContext { passages }),
                        status: KnowledgeStatus::Used { passages: n },
                    }
                }
            }
            Err(reason) => {
                tracing::warn!(error = %reason, "knowledge retrieval failed, continuing without it");
                FusedKnowledge {
                    context: None,
                    status: KnowledgeStatus::Unavailable { reason },
                }
            }
        }
    }
}
