//! 错误分类：感知 / 校验 / 执行 / 知识 / 会话 / 超时
//!
//! 只有 SessionClosed / SessionNotFound 与终态（BLOCKED / FAILED）会到达调用方，
//! 其余错误都在回合内被重试、重新规划或降级吸收。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::state::{DecisionState, SessionMode};
use crate::decision::ActionKind;
use crate::llm::LlmError;
use crate::perception::ElementId;

/// 决策循环中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 页面不可达或读取失败（已重建一次 WorldView 仍失败）
    #[error("Perception failure: {0}")]
    PerceptionFailure(String),

    #[error("Validation rejected: {0}")]
    ValidationRejection(Rejection),

    /// 执行器报告失败
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Knowledge unavailable: {0}")]
    KnowledgeUnavailable(String),

    /// 会话已结束（DONE / FAILED），属于调用方的使用错误
    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Turn timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    /// 提案输出无法解析
    #[error("Proposal parse error: {0}")]
    JsonParseError(String),

    /// 状态机出现转移表之外的跳转（实现缺陷）
    #[error("Illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: Option<DecisionState>,
        to: DecisionState,
    },

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 映射为记录在 Step 上的失败类别；非回合失败类错误返回 None
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            AgentError::PerceptionFailure(_) => Some(FailureKind::Perception),
            AgentError::ExecutionFailure(_) => Some(FailureKind::Execution),
            AgentError::Timeout(_) => Some(FailureKind::Timeout),
            _ => None,
        }
    }
}

/// Step 上记录的失败类别；Timeout 与 Execution 一样交给恢复策略处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Perception,
    Execution,
    Timeout,
}

/// 校验器的类型化拒绝原因
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("target {target} is not present on the current page")]
    TargetNotFound { target: ElementId },

    #[error("{action} failed last turn and nothing has changed since")]
    RepeatedFailure { action: String },

    #[error("{kind} is not allowed in {mode} mode")]
    DisallowedInMode { kind: ActionKind, mode: SessionMode },

    /// 动作产生于另一份 WorldView
    #[error("action was proposed against a different page snapshot")]
    StaleWorldView { expected: u64, actual: u64 },

    #[error("{kind} requires a payload")]
    MissingPayload { kind: ActionKind },
}

impl Rejection {
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::TargetNotFound { .. } => "target_not_found",
            Rejection::RepeatedFailure { .. } => "repeated_failure",
            Rejection::DisallowedInMode { .. } => "disallowed_in_mode",
            Rejection::StaleWorldView { .. } => "stale_world_view",
            Rejection::MissingPayload { .. } => "missing_payload",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            AgentError::Timeout(Duration::from_secs(1)).failure_kind(),
            Some(FailureKind::Timeout)
        );
        assert_eq!(
            AgentError::PerceptionFailure("tab crashed".into()).failure_kind(),
            Some(FailureKind::Perception)
        );
        assert!(AgentError::SessionClosed("s".into()).failure_kind().is_none());
    }

    #[test]
    fn test_rejection_serializes_with_reason_tag() {
        let r = Rejection::TargetNotFound {
            target: ElementId::new("button-1a2b3c4d"),
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["reason"], "target_not_found");
        assert_eq!(json["target"], "button-1a2b3c4d");
        assert_eq!(r.label(), "target_not_found");

        let r = Rejection::DisallowedInMode {
            kind: ActionKind::Navigate,
            mode: SessionMode::Question,
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["reason"], r.label());
        assert_eq!(json["kind"], "navigate");
        let back: Rejection = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }
}
