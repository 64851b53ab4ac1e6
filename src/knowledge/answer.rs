//! 问答路径：QUESTION 意图不经过校验 / 执行，直接基于检索结果生成回答

use std::sync::Arc;

use crate::knowledge::KnowledgeContext;
use crate::llm::{LlmClient, Message, Transcript};
use crate::perception::WorldView;

/// 没有检索到任何内容时的固定回答
pub const NO_KNOWLEDGE_ANSWER: &str =
    "I'm sorry, but I couldn't find any information on that topic in my knowledge base.";

const SYSTEM_PROMPT: &str = "You are a helpful assistant for a web application. \
Answer the user's question using only the provided context. \
If the context does not contain the answer, say so briefly. Keep answers short and concrete.";

pub struct QuestionAnswerer {
    llm: Option<Arc<dyn LlmClient>>,
}

impl QuestionAnswerer {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    /// 生成回答；LLM 不可用时退化为引用最相关的段落
    pub async fn answer(
        &self,
        question: &str,
        knowledge: Option<&KnowledgeContext>,
        world_view: Option<&WorldView>,
        transcript: &Transcript,
    ) -> String {
        let Some(context) = knowledge.filter(|k| !k.is_empty()) else {
            return NO_KNOWLEDGE_ANSWER.to_string();
        };

        let Some(llm) = &self.llm else {
            return quote_best(context);
        };

        let mut prompt = format!("Context:\n{}\n", context.to_prompt_section());
        if let Some(wv) = world_view {
            prompt.push_str(&format!("\nCurrent page: {} ({})\n", wv.title, wv.url));
        }
        prompt.push_str(&format!("\nQuestion: {}", question));

        let mut messages = vec![Message::system(SYSTEM_PROMPT)];
        messages.extend(transcript.messages());
        messages.push(Message::user(prompt));

        match llm.complete(&messages).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => quote_best(context),
            Err(e) => {
                tracing::warn!(error = %e, "answer generation failed, quoting top passage");
                quote_best(context)
            }
        }
    }
}

fn quote_best(context: &KnowledgeContext) -> String {
    match context.passages.first() {
        Some(p) => format!("From the knowledge base: {}", p.text.trim()),
        None => NO_KNOWLEDGE_ANSWER.to_string(),
    }
}
