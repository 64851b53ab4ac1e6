//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod embedding;
pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use message::{Message, Role, Transcript};
pub use mock::MockLlmClient;
pub use openai::{
    create_llm_from_config, create_vision_from_config, OpenAiClient, OpenAiVisionDescriber, TokenUsage,
};
pub use traits::{LlmClient, LlmError, RetryConfig, RetryingLlmClient};
