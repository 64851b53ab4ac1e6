//! 提案方：根据 DecisionContext 给出下一步动作
//!
//! LlmProposer 调用 LLM，输出格式为 `<thinking>…</thinking><json_response>{…}</json_response>`，
//! 兼容 ```json 代码块与裸 JSON。RuleBasedProposer 不依赖模型，按目标里的 key=value 填表并提交。

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::core::AgentError;
use crate::decision::{Action, ActionKind, DecisionContext};
use crate::llm::{LlmClient, Message};
use crate::perception::{ElementId, ElementRole, WorldView};

/// 候选动作；confidence 缺省视为 1.0
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub action: Action,
    pub confidence: Option<f32>,
}

impl Candidate {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            confidence: None,
        }
    }

    pub fn confidence(&self) -> f32 {
        self.confidence.unwrap_or(1.0)
    }
}

/// 提案方的总体判断
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Proceed,
    /// 目标无法达成（附说明），会话进入 BLOCKED
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct Proposal {
    pub candidates: Vec<Candidate>,
    pub rationale: Option<String>,
    pub verdict: Verdict,
}

/// 提案能力：纯函数、可重试、自身无副作用
#[async_trait]
pub trait ActionProposer: Send + Sync {
    async fn propose(&self, ctx: &DecisionContext) -> Result<Proposal, AgentError>;
}

pub const DEFAULT_PROPOSER_PROMPT: &str = r#"You are a web automation agent. You operate a real web page one action at a time.

Each turn you receive the objective, the interactive elements of the current page (each with an id in brackets), the previous steps and any problems with earlier proposals.
Decide the single next action that moves toward the objective.

Action types:
- CLICK: click an element. Requires target_agent_id.
- TYPE: type text into an input. Requires target_agent_id and type_value.
- NAVIGATE: open a URL. Requires url.
- WAIT: wait for the page to settle. Optional type_value in milliseconds.
- ASK_USER: you need information only the user has. Requires user_question.
- FINISH: the objective is complete. Put a short summary in status_message.
- FAIL: the objective cannot be achieved on this site. Explain why.

Rules:
- Only use element ids that appear in the current page list.
- Never repeat an action listed under "Do not propose these again".
- If several actions are equally good, list them all in order of preference and give each a confidence between 0 and 1.

Respond exactly in this format:
<thinking>your reasoning</thinking>
<json_response>
{"actions": [{"type": "CLICK", "target_agent_id": "...", "type_value": null, "url": null, "user_question": null, "status_message": null, "explanation": "...", "confidence": 0.9}], "overall_explanation_of_bundle": "..."}
</json_response>"#;

pub struct LlmProposer {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmProposer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_PROPOSER_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }
}

#[async_trait]
impl ActionProposer for LlmProposer {
    async fn propose(&self, ctx: &DecisionContext) -> Result<Proposal, AgentError> {
        let messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::user(ctx.to_prompt()),
        ];
        let output = self.llm.complete(&messages).await?;
        parse_proposal(&output, &ctx.world_view)
    }
}

#[derive(Debug, Deserialize)]
struct RawProposal {
    #[serde(alias = "candidates")]
    actions: Vec<RawAction>,
    #[serde(default, alias = "explanation")]
    overall_explanation_of_bundle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    #[serde(rename = "type", alias = "kind", alias = "action")]
    kind: String,
    #[serde(default, alias = "target", alias = "target_id")]
    target_agent_id: Option<String>,
    #[serde(default, alias = "text", alias = "value", alias = "payload")]
    type_value: Option<serde_json::Value>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, alias = "question")]
    user_question: Option<String>,
    #[serde(default, alias = "summary")]
    status_message: Option<String>,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

fn thinking_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<thinking>(.*?)</thinking>").ok())
        .as_ref()
}

fn json_response_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<json_response>(.*?)</json_response>").ok())
        .as_ref()
}

/// 第一个捕获组
fn capture<'a>(re: Option<&Regex>, text: &'a str) -> Option<&'a str> {
    re?.captures(text)?.get(1).map(|m| m.as_str().trim())
}

/// 提取 JSON：<json_response> 标签 → ```json 代码块 → 第一个 { 到最后一个 }
fn extract_json(output: &str) -> Option<&str> {
    if let Some(inner) = capture(json_response_re(), output) {
        return Some(inner);
    }
    if let Some(start) = output.find("```json") {
        let rest = &output[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    (end > start).then(|| &output[start..=end])
}

/// 解析 LLM 输出；未知动作类型被跳过，全部无效时返回 JsonParseError。
/// FAIL 只有作为首个动作时才是放弃判定，排在其他动作之后的 FAIL 当作无效条目跳过
pub fn parse_proposal(output: &str, world_view: &WorldView) -> Result<Proposal, AgentError> {
    let thinking = capture(thinking_re(), output)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let json = extract_json(output)
        .ok_or_else(|| AgentError::JsonParseError("no JSON found in proposal".to_string()))?;
    let raw: RawProposal = serde_json::from_str(json)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json)))?;

    let rationale = thinking.or(raw.overall_explanation_of_bundle.clone());
    let mut candidates = Vec::new();

    for (index, ra) in raw.actions.into_iter().enumerate() {
        if ra.kind.trim().eq_ignore_ascii_case("fail") {
            if index > 0 {
                tracing::warn!(index, "skipping FAIL that follows other actions");
                continue;
            }
            let reason = ra
                .explanation
                .or(ra.status_message)
                .unwrap_or_else(|| "The objective cannot be completed on this page.".to_string());
            return Ok(Proposal {
                candidates: Vec::new(),
                rationale,
                verdict: Verdict::Fail(reason),
            });
        }
        let kind = match ra.kind.parse::<ActionKind>() {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(error = %e, "skipping proposal candidate");
                continue;
            }
        };
        let type_value = ra.type_value.and_then(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });
        let payload = match kind {
            ActionKind::Type | ActionKind::Wait => type_value,
            ActionKind::Navigate => ra.url.or(type_value),
            ActionKind::AskUser => ra.user_question.or(type_value),
            ActionKind::Finish => ra.status_message.or(ra.explanation.clone()),
            ActionKind::Click => None,
        };
        let mut action = Action::new(kind).observed_on(world_view);
        action.target = ra
            .target_agent_id
            .map(|t| t.trim().trim_matches(|c| c == '[' || c == ']').to_string())
            .filter(|t| !t.is_empty())
            .map(ElementId::new);
        action.payload = payload;
        action.explanation = ra.explanation;
        candidates.push(Candidate {
            action,
            confidence: ra.confidence,
        });
    }

    if candidates.is_empty() {
        return Err(AgentError::JsonParseError(
            "proposal contained no usable actions".to_string(),
        ));
    }
    Ok(Proposal {
        candidates,
        rationale,
        verdict: Verdict::Proceed,
    })
}

const SUBMIT_WORDS: &[&str] = &["log in", "login", "sign in", "submit", "continue", "next"];
const SUCCESS_WORDS: &[&str] = &["log out", "logout", "sign out", "welcome"];

/// 不依赖模型的提案方：填写目标中的 key=value 字段，点击提交，看到登录后元素即完成
#[derive(Debug, Default)]
pub struct RuleBasedProposer;

impl RuleBasedProposer {
    pub fn new() -> Self {
        Self
    }

    fn fields(objective: &str) -> Vec<(String, String)> {
        objective
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .filter_map(|tok| {
                let (k, v) = tok.split_once('=')?;
                let (k, v) = (k.trim().to_lowercase(), v.trim());
                (!k.is_empty() && !v.is_empty()).then(|| (k, v.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl ActionProposer for RuleBasedProposer {
    async fn propose(&self, ctx: &DecisionContext) -> Result<Proposal, AgentError> {
        let wv = &ctx.world_view;
        let proceed = |candidates: Vec<Candidate>, why: String| Proposal {
            candidates,
            rationale: Some(why),
            verdict: Verdict::Proceed,
        };

        if wv
            .elements
            .iter()
            .any(|e| SUCCESS_WORDS.iter().any(|w| e.label.to_lowercase().contains(w)))
        {
            let summary = format!("Objective complete: {}", wv.title);
            return Ok(proceed(
                vec![Candidate::new(Action::finish(summary).observed_on(wv))],
                "A post-login element is visible.".to_string(),
            ));
        }

        for (key, value) in Self::fields(&ctx.objective) {
            let Some(field) = wv.elements.iter().find(|e| {
                e.role == ElementRole::Textbox && e.label.to_lowercase().contains(&key)
            }) else {
                continue;
            };
            let action = Action::type_text(field.id.clone(), value).observed_on(wv);
            if ctx.already_done(&action) || ctx.is_avoided(&action) {
                continue;
            }
            return Ok(proceed(
                vec![Candidate::new(action)],
                format!("Fill the {} field.", field.label),
            ));
        }

        let submits: Vec<Candidate> = wv
            .elements
            .iter()
            .filter(|e| {
                e.role == ElementRole::Button
                    && SUBMIT_WORDS.iter().any(|w| e.label.to_lowercase().contains(w))
            })
            .map(|e| Action::click(e.id.clone()).observed_on(wv))
            .filter(|a| !ctx.is_avoided(a))
            .map(Candidate::new)
            .collect();
        if !submits.is_empty() {
            return Ok(proceed(submits, "Submit the form.".to_string()));
        }

        let question = format!(
            "I could not work out the next step toward \"{}\" on this page. What should I do?",
            ctx.objective
        );
        Ok(proceed(
            vec![Candidate::new(Action::ask_user(question).observed_on(wv))],
            "No applicable rule.".to_string(),
        ))
    }
}
