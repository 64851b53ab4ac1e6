//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WEBPILOT__*` 覆盖（双下划线表示嵌套，如 `WEBPILOT__AGENT__RETRY_BOUND=3`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::decision::ActionKind;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub knowledge: KnowledgeSection,
    pub perception: PerceptionSection,
    pub session: SessionSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 提案方 system prompt 文件，未设置时使用内置 prompt
    pub proposer_prompt_path: Option<PathBuf>,
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 嵌入模型（知识库向量检索）
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            embedding_model: default_embedding_model(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

/// [agent] 段：决策循环的预算
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// 同一动作最多尝试次数（含首次）
    #[serde(default = "default_retry_bound")]
    pub retry_bound: u32,
    /// 同一目标最多尝试的不同动作数，超出即 BLOCKED
    #[serde(default = "default_replan_bound")]
    pub replan_bound: u32,
    /// 一回合内校验失败后最多重新提案次数
    #[serde(default = "default_max_reproposals")]
    pub max_reproposals: u32,
    /// 单回合超时（秒），调用方可逐回合覆盖
    #[serde(default = "default_turn_timeout")]
    pub turn_timeout_secs: u64,
    /// 拼入提案上下文的最近 Step 数
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// COMMAND 模式允许的动作
    #[serde(default = "default_command_actions")]
    pub command_actions: Vec<ActionKind>,
    /// QUESTION 模式允许的动作
    #[serde(default = "default_question_actions")]
    pub question_actions: Vec<ActionKind>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            retry_bound: default_retry_bound(),
            replan_bound: default_replan_bound(),
            max_reproposals: default_max_reproposals(),
            turn_timeout_secs: default_turn_timeout(),
            history_window: default_history_window(),
            command_actions: default_command_actions(),
            question_actions: default_question_actions(),
        }
    }
}

fn default_retry_bound() -> u32 {
    2
}

fn default_replan_bound() -> u32 {
    3
}

fn default_max_reproposals() -> u32 {
    2
}

fn default_turn_timeout() -> u64 {
    90
}

fn default_history_window() -> usize {
    12
}

fn default_command_actions() -> Vec<ActionKind> {
    ActionKind::ALL.to_vec()
}

fn default_question_actions() -> Vec<ActionKind> {
    vec![
        ActionKind::Navigate,
        ActionKind::Wait,
        ActionKind::AskUser,
        ActionKind::Finish,
    ]
}

/// [knowledge] 段：检索参数
#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeSection {
    /// init 未显式指定时是否启用知识检索
    #[serde(default)]
    pub enabled_by_default: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// 低于该分数的段落丢弃
    #[serde(default)]
    pub min_score: f32,
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            enabled_by_default: false,
            top_k: default_top_k(),
            min_score: 0.0,
        }
    }
}

fn default_top_k() -> usize {
    5
}

/// [perception] 段
#[derive(Debug, Clone, Deserialize)]
pub struct PerceptionSection {
    /// 打开后截图并请求视觉描述（需要可用的 API key）
    #[serde(default)]
    pub vision_enabled: bool,
    /// 多模态模型名，缺省时使用 llm.model
    #[serde(default)]
    pub vision_model: Option<String>,
    /// WorldView 最多保留的元素数
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
}

impl Default for PerceptionSection {
    fn default() -> Self {
        Self {
            vision_enabled: false,
            vision_model: None,
            max_elements: default_max_elements(),
        }
    }
}

fn default_max_elements() -> usize {
    150
}

/// [session] 段
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 空闲超过该时长的会话被清理
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// 问答路径保留的历史问答轮数
    #[serde(default = "default_max_answer_history")]
    pub max_answer_history: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            max_answer_history: default_max_answer_history(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    1800
}

fn default_max_answer_history() -> usize {
    5
}

/// 从 config 目录加载配置，环境变量 WEBPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WEBPILOT__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WEBPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.retry_bound, 2);
        assert_eq!(cfg.agent.replan_bound, 3);
        assert_eq!(cfg.knowledge.top_k, 5);
        assert!(cfg.agent.command_actions.contains(&ActionKind::Click));
        assert!(!cfg.agent.question_actions.contains(&ActionKind::Type));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pilot.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[agent]\nretry_bound = 4\ncommand_actions = [\"click\", \"finish\"]\n\n[knowledge]\ntop_k = 2"
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.retry_bound, 4);
        assert_eq!(cfg.agent.replan_bound, 3);
        assert_eq!(
            cfg.agent.command_actions,
            vec![ActionKind::Click, ActionKind::Finish]
        );
        assert_eq!(cfg.knowledge.top_k, 2);
        assert_eq!(cfg.session.idle_timeout_secs, 1800);
    }
}
