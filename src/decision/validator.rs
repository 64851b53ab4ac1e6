//! 校验器：动作执行前的最后一道检查
//!
//! 检查顺序：模式许可 → payload → 目标存在 → WorldView 指纹 → 重复失败。
//! 拒绝原因是类型化的 Rejection，由决策引擎在回合内消化（重新规划），不直接返回给调用方。

use std::collections::HashSet;

use crate::config::AgentSection;
use crate::core::{Rejection, SessionMode};
use crate::decision::{Action, ActionKind};
use crate::perception::WorldView;
use crate::session::Step;

/// 各模式允许的动作类型。两个集合都来自 `[agent]` 配置，
/// 收窄 `command_actions` 后会话回合也会得到 DisallowedInMode 拒绝
#[derive(Debug, Clone)]
pub struct ModePolicy {
    command: HashSet<ActionKind>,
    question: HashSet<ActionKind>,
}

impl Default for ModePolicy {
    fn default() -> Self {
        Self::from_config(&AgentSection::default())
    }
}

impl ModePolicy {
    pub fn from_config(agent: &AgentSection) -> Self {
        Self {
            command: agent.command_actions.iter().copied().collect(),
            question: agent.question_actions.iter().copied().collect(),
        }
    }

    pub fn allows(&self, mode: SessionMode, kind: ActionKind) -> bool {
        match mode {
            SessionMode::Command => self.command.contains(&kind),
            SessionMode::Question => self.question.contains(&kind),
        }
    }
}

/// 上下文变化信号（除 WorldView 指纹之外）
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextSignals {
    /// 本回合有新的用户输入
    pub fresh_utterance: bool,
    /// 恢复策略明确要求重试该动作
    pub retry_sanctioned: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    policy: ModePolicy,
}

impl Validator {
    pub fn new(policy: ModePolicy) -> Self {
        Self { policy }
    }

    pub fn validate(
        &self,
        action: &Action,
        world_view: &WorldView,
        history: &[Step],
        mode: SessionMode,
        signals: ContextSignals,
    ) -> Result<(), Rejection> {
        if !self.policy.allows(mode, action.kind) {
            return Err(Rejection::DisallowedInMode {
                kind: action.kind,
                mode,
            });
        }

        if action.kind.requires_payload()
            && action.payload.as_deref().map_or(true, |p| p.trim().is_empty())
        {
            return Err(Rejection::MissingPayload { kind: action.kind });
        }

        if action.kind.requires_target() {
            match &action.target {
                Some(target) if world_view.contains(target) => {}
                Some(target) => {
                    return Err(Rejection::TargetNotFound {
                        target: target.clone(),
                    })
                }
                None => return Err(Rejection::MissingPayload { kind: action.kind }),
            }
        }

        if action.observed != world_view.fingerprint() {
            return Err(Rejection::StaleWorldView {
                expected: world_view.fingerprint(),
                actual: action.observed,
            });
        }

        if let Some(last) = history.iter().rev().find(|s| s.execution.is_some()) {
            let repeated = last.failed()
                && last.action.as_ref().is_some_and(|a| a.same_intent(action));
            let page_changed = last
                .world_view
                .as_ref()
                .map_or(true, |wv| wv.fingerprint() != world_view.fingerprint());
            if repeated && !page_changed && !signals.fresh_utterance && !signals.retry_sanctioned {
                return Err(Rejection::RepeatedFailure {
                    action: action.describe(),
                });
            }
        }

        Ok(())
    }
}
