//! 组件装配
//!
//! 从配置构建 LLM、提案方、意图识别、知识融合与决策引擎，再交给 SessionManager。
//! provider 为 mock 或没有 API key 时使用规则提案方，整个流程不依赖网络。
//! perception.vision_enabled 打开且有 API key 时，WorldView 构建附带截图的视觉描述。

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::{AppConfig, LlmSection, PerceptionSection};
use crate::core::{RecoveryPolicy, RecoveryStrategy};
use crate::decision::{
    ActionProposer, DecisionEngine, DecisionEvent, IntentClassifier, LlmProposer, ModePolicy,
    RuleBasedProposer, Validator,
};
use crate::knowledge::{KnowledgeFuser, KnowledgeRetriever, QuestionAnswerer};
use crate::llm::{create_llm_from_config, create_vision_from_config, LlmClient};
use crate::perception::{VisionDescriber, WorldViewBuilder};
use crate::session::{PageProvider, SessionManager};

/// 未配置 proposer_prompt_path 时依次查找的位置
const PROMPT_CANDIDATES: &[&str] = &["config/prompts/proposer.txt", "../config/prompts/proposer.txt"];

/// 预构建的组件，可被多个会话共享
pub struct AgentComponents {
    pub engine: Arc<DecisionEngine>,
    pub classifier: Arc<IntentClassifier>,
    /// None 表示离线（规则提案方）
    pub llm: Option<Arc<dyn LlmClient>>,
}

/// 配置的后端是否有可用的 API key
pub fn has_api_key(llm: &LlmSection) -> bool {
    let vars: &[&str] = match llm.provider.as_str() {
        "mock" => return false,
        "deepseek" => &["DEEPSEEK_API_KEY", "OPENAI_API_KEY"],
        _ => &["OPENAI_API_KEY"],
    };
    vars.iter().any(|v| {
        std::env::var(v)
            .map(|k| !k.trim().is_empty() && k != "sk-placeholder")
            .unwrap_or(false)
    })
}

fn load_proposer_prompt(path: Option<&Path>) -> Option<String> {
    if let Some(p) = path {
        match std::fs::read_to_string(p) {
            Ok(text) => return Some(text),
            Err(e) => tracing::warn!(path = %p.display(), error = %e, "proposer prompt unreadable, using built-in"),
        }
    }
    PROMPT_CANDIDATES
        .iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
}

/// vision_enabled 时按配置创建视觉描述器；离线时为 None
fn vision_describer(cfg: &AppConfig) -> Option<Arc<dyn VisionDescriber>> {
    if !cfg.perception.vision_enabled {
        return None;
    }
    if !has_api_key(&cfg.llm) {
        tracing::warn!("vision enabled but no LLM credentials, using DOM only");
        return None;
    }
    let model = cfg
        .perception
        .vision_model
        .as_deref()
        .unwrap_or(cfg.llm.model.as_str());
    tracing::info!(model, "vision describer enabled");
    Some(create_vision_from_config(&cfg.llm, model))
}

/// 只有 vision_enabled 时才把描述器挂到构建器上
pub fn world_view_builder(
    perception: &PerceptionSection,
    vision: Option<Arc<dyn VisionDescriber>>,
) -> WorldViewBuilder {
    let builder = WorldViewBuilder::new(perception.max_elements);
    match vision {
        Some(vision) if perception.vision_enabled => builder.with_vision(vision),
        _ => builder,
    }
}

pub fn create_agent_components(
    cfg: &AppConfig,
    retriever: Option<Arc<dyn KnowledgeRetriever>>,
    event_tx: Option<UnboundedSender<DecisionEvent>>,
) -> AgentComponents {
    let llm = has_api_key(&cfg.llm).then(|| create_llm_from_config(&cfg.llm));

    let proposer: Arc<dyn ActionProposer> = match &llm {
        Some(llm) => {
            let mut proposer = LlmProposer::new(llm.clone());
            if let Some(prompt) = load_proposer_prompt(cfg.app.proposer_prompt_path.as_deref()) {
                proposer = proposer.with_system_prompt(prompt);
            }
            tracing::info!(provider = %cfg.llm.provider, model = %cfg.llm.model, "using LLM proposer");
            Arc::new(proposer)
        }
        None => {
            tracing::info!("no LLM credentials, using rule-based proposer");
            Arc::new(RuleBasedProposer::new())
        }
    };

    let engine = DecisionEngine::new(
        world_view_builder(&cfg.perception, vision_describer(cfg)),
        KnowledgeFuser::new(retriever, &cfg.knowledge),
        proposer,
        Validator::new(ModePolicy::from_config(&cfg.agent)),
        RecoveryStrategy::new(RecoveryPolicy::from_config(&cfg.agent)),
        QuestionAnswerer::new(llm.clone()),
        &cfg.agent,
    );
    let engine = match event_tx {
        Some(tx) => engine.with_event_tx(tx),
        None => engine,
    };

    AgentComponents {
        engine: Arc::new(engine),
        classifier: Arc::new(IntentClassifier::new(llm.clone())),
        llm,
    }
}

/// 一步构建 SessionManager
pub fn create_session_manager(
    cfg: &AppConfig,
    provider: Arc<dyn PageProvider>,
    retriever: Option<Arc<dyn KnowledgeRetriever>>,
    event_tx: Option<UnboundedSender<DecisionEvent>>,
) -> SessionManager {
    let components = create_agent_components(cfg, retriever, event_tx);
    SessionManager::new(components.engine, components.classifier, provider, cfg)
}
