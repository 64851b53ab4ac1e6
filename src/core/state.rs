//! 状态定义：决策状态机、会话状态与会话模式
//!
//! DecisionState 的合法跳转由 `allowed_next` 这张转移表唯一确定；
//! StateTrace 记录一回合内走过的状态，跨回合时从上一回合的终止状态续接。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 决策状态机的状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Planning,
    ActionProposed,
    Validated,
    Executed,
    Succeeded,
    Failed,
    Done,
    Blocked,
    AwaitingInput,
    /// 基础设施故障（提案方不可用等），对应会话 FAILED
    Faulted,
}

impl DecisionState {
    /// 转移表
    pub fn allowed_next(self) -> &'static [DecisionState] {
        use DecisionState::*;
        match self {
            Planning => &[ActionProposed, Blocked, Failed, Faulted],
            ActionProposed => &[Validated, Planning, Blocked],
            Validated => &[Executed, Done, AwaitingInput, Failed],
            Executed => &[Succeeded, Failed],
            Succeeded => &[Planning],
            Failed => &[Planning, Blocked],
            AwaitingInput => &[Planning],
            Done | Blocked | Faulted => &[],
        }
    }

    pub fn can_transition_to(self, next: DecisionState) -> bool {
        self.allowed_next().contains(&next)
    }

    /// 一回合可以停在这些状态上
    pub fn ends_turn(self) -> bool {
        matches!(
            self,
            DecisionState::Succeeded
                | DecisionState::Failed
                | DecisionState::Done
                | DecisionState::Blocked
                | DecisionState::AwaitingInput
                | DecisionState::Faulted
        )
    }
}

/// 一回合的状态轨迹
#[derive(Clone, Debug)]
pub struct StateTrace {
    current: Option<DecisionState>,
    visited: Vec<DecisionState>,
}

impl StateTrace {
    /// 从上一回合的终止状态续接（首回合为 None）
    pub fn resume(previous: Option<DecisionState>) -> Self {
        Self {
            current: previous,
            visited: Vec::new(),
        }
    }

    pub fn current(&self) -> Option<DecisionState> {
        self.current
    }

    pub fn advance(&mut self, next: DecisionState) -> Result<(), AgentError> {
        let legal = match self.current {
            None => next == DecisionState::Planning,
            Some(from) => from.can_transition_to(next),
        };
        if !legal {
            return Err(AgentError::IllegalTransition {
                from: self.current,
                to: next,
            });
        }
        tracing::trace!(from = ?self.current, to = ?next, "decision transition");
        self.current = Some(next);
        self.visited.push(next);
        Ok(())
    }

    pub fn visited(&self) -> &[DecisionState] {
        &self.visited
    }

    pub fn into_visited(self) -> Vec<DecisionState> {
        self.visited
    }
}

/// 会话状态（调用方可见）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Done,
    Failed,
    AwaitingInput,
    /// 无法继续推进目标；新的用户输入可以重新激活
    Blocked,
}

impl SessionStatus {
    /// DONE / FAILED 之后不再接受任何回合
    pub fn is_closed(self) -> bool {
        matches!(self, SessionStatus::Done | SessionStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Done => "DONE",
            SessionStatus::Failed => "FAILED",
            SessionStatus::AwaitingInput => "AWAITING_INPUT",
            SessionStatus::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话模式：执行指令或回答问题
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Command,
    Question,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Command => f.write_str("command"),
            SessionMode::Question => f.write_str("question"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_turn_must_start_planning() {
        let mut trace = StateTrace::resume(None);
        assert!(trace.advance(DecisionState::Validated).is_err());
        assert!(trace.advance(DecisionState::Planning).is_ok());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut trace = StateTrace::resume(None);
        for s in [
            DecisionState::Planning,
            DecisionState::ActionProposed,
            DecisionState::Validated,
            DecisionState::Executed,
            DecisionState::Succeeded,
        ] {
            trace.advance(s).unwrap();
        }
        assert_eq!(trace.visited().len(), 5);
        assert!(trace.current().unwrap().ends_turn());
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        for s in [DecisionState::Done, DecisionState::Blocked, DecisionState::Faulted] {
            assert!(s.allowed_next().is_empty());
        }
        let mut trace = StateTrace::resume(Some(DecisionState::Done));
        assert!(matches!(
            trace.advance(DecisionState::Planning),
            Err(AgentError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn test_rejection_loops_back_to_planning() {
        assert!(DecisionState::ActionProposed.can_transition_to(DecisionState::Planning));
        assert!(!DecisionState::Executed.can_transition_to(DecisionState::Planning));
        assert!(DecisionState::AwaitingInput.can_transition_to(DecisionState::Planning));
    }

    #[test]
    fn test_status_closed() {
        assert!(SessionStatus::Done.is_closed());
        assert!(SessionStatus::Failed.is_closed());
        assert!(!SessionStatus::Blocked.is_closed());
        assert_eq!(SessionStatus::AwaitingInput.to_string(), "AWAITING_INPUT");
    }
}
