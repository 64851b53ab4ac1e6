//! 决策上下文：每回合从目标、历史、WorldView 与知识重新推导，不保存计划

use std::sync::Arc;

use crate::core::SessionMode;
use crate::decision::Action;
use crate::knowledge::KnowledgeContext;
use crate::perception::WorldView;
use crate::session::Step;

/// 历史摘要中的一行
#[derive(Debug, Clone)]
pub struct StepDigest {
    pub seq: u64,
    pub action: Option<Action>,
    /// None 表示未执行
    pub succeeded: Option<bool>,
    pub note: String,
}

impl StepDigest {
    pub fn from_step(step: &Step) -> Self {
        let note = match (&step.execution, &step.answer) {
            (Some(e), _) if !e.success => e.error_detail.clone().unwrap_or_default(),
            (_, Some(answer)) => format!("answered: {}", preview(answer, 80)),
            _ => step.message.clone(),
        };
        Self {
            seq: step.seq,
            action: step.action.clone(),
            succeeded: step.execution.as_ref().map(|e| e.success),
            note,
        }
    }
}

/// 提案方看到的全部输入
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub objective: String,
    pub mode: SessionMode,
    /// 本回合的新用户输入
    pub utterance: Option<String>,
    pub world_view: Arc<WorldView>,
    pub knowledge: Option<KnowledgeContext>,
    /// 最近若干 Step（旧到新）
    pub history: Vec<StepDigest>,
    /// 本回合的拒绝原因与恢复策略注入的失败原因
    pub feedback: Vec<String>,
    /// 不要再提议的动作
    pub avoid: Vec<Action>,
    /// 页面自上一份 WorldView 以来是否变化
    pub page_changed: bool,
}

impl DecisionContext {
    /// 是否已经成功执行过同一意图的动作
    pub fn already_done(&self, action: &Action) -> bool {
        self.history
            .iter()
            .any(|d| d.succeeded == Some(true) && d.action.as_ref().is_some_and(|a| a.same_intent(action)))
    }

    pub fn is_avoided(&self, action: &Action) -> bool {
        self.avoid.iter().any(|a| a.same_intent(action))
    }

    /// 渲染为提案 prompt 的 user 消息
    pub fn to_prompt(&self) -> String {
        let mut out = format!("# Objective\n{}\n\n", self.objective);
        if let Some(u) = &self.utterance {
            out.push_str(&format!("# Latest user message\n{}\n\n", u));
        }

        out.push_str("# Current page\n");
        out.push_str(&self.world_view.to_prompt_section());
        out.push_str(if self.page_changed {
            "The page changed since the previous turn.\n\n"
        } else {
            "The page has NOT changed since the previous turn.\n\n"
        });

        if let Some(k) = self.knowledge.as_ref().filter(|k| !k.is_empty()) {
            out.push_str("# Relevant knowledge\n");
            out.push_str(&k.to_prompt_section());
            out.push('\n');
        }

        if !self.history.is_empty() {
            out.push_str("# Previous steps\n");
            for d in &self.history {
                let action = d.action.as_ref().map(|a| a.describe()).unwrap_or_else(|| "-".into());
                let result = match d.succeeded {
                    Some(true) => "ok",
                    Some(false) => "FAILED",
                    None => "not executed",
                };
                out.push_str(&format!("{}. {} -> {}", d.seq, action, result));
                if !d.note.is_empty() {
                    out.push_str(&format!(" ({})", d.note));
                }
                out.push('\n');
            }
            out.push('\n');
        }

        if !self.feedback.is_empty() {
            out.push_str("# Problems with earlier proposals\n");
            for f in &self.feedback {
                out.push_str(&format!("- {}\n", f));
            }
            out.push('\n');
        }
        if !self.avoid.is_empty() {
            out.push_str("# Do not propose these again\n");
            for a in &self.avoid {
                out.push_str(&format!("- {}\n", a.describe()));
            }
        }
        out
    }
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}
