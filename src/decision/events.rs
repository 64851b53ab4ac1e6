//! 决策过程事件：供前端 / CLI 实时展示每个回合的进展

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::{RecoveryDecision, SessionStatus};
use crate::knowledge::KnowledgeStatus;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionEvent {
    TurnStarted { session_id: String, turn: u64 },
    WorldViewBuilt { elements: usize, page_changed: bool },
    Knowledge { status: KnowledgeStatus },
    Proposed { action: String, rationale: Option<String> },
    Rejected { action: String, reason: String },
    Executed { action: String, success: bool, detail: Option<String> },
    Recovery { decision: RecoveryDecision },
    Answered { preview: String },
    TurnFinished { status: SessionStatus, message: String },
}

pub(crate) fn send_event(tx: &Option<UnboundedSender<DecisionEvent>>, ev: DecisionEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
