//! 单个会话：目标、模式、状态与只追加的历史

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::core::{DecisionState, SessionMode, SessionStatus};
use crate::decision::PendingDirective;
use crate::llm::Transcript;
use crate::session::{PageHandles, StepLog};

/// 会话 ID
pub type SessionId = String;

pub struct Session {
    pub id: SessionId,
    pub objective: String,
    pub start_url: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    /// 已完成的回合数
    pub turn: u64,
    pub knowledge_enabled: bool,
    pub log: StepLog,
    /// 上一回合状态机停在的状态，下一回合从这里续接
    pub last_state: Option<DecisionState>,
    pub directive: Option<PendingDirective>,
    /// AWAITING_INPUT 时等待用户回答的问题
    pub pending_question: Option<String>,
    /// 问答路径的对话记录
    pub transcript: Transcript,
    pub handles: PageHandles,
    pub created_at: DateTime<Utc>,
    pub last_active: Instant,
}

/// 生成新的会话 ID
pub fn new_session_id() -> SessionId {
    format!("session_{}", uuid::Uuid::new_v4())
}

impl Session {
    pub fn new(
        id: SessionId,
        objective: impl Into<String>,
        start_url: impl Into<String>,
        mode: SessionMode,
        knowledge_enabled: bool,
        handles: PageHandles,
        max_answer_history: usize,
    ) -> Self {
        Self {
            id,
            objective: objective.into(),
            start_url: start_url.into(),
            mode,
            status: SessionStatus::Active,
            turn: 0,
            knowledge_enabled,
            log: StepLog::new(),
            last_state: None,
            directive: None,
            pending_question: None,
            transcript: Transcript::new(max_answer_history),
            handles,
            created_at: Utc::now(),
            last_active: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }

    /// 最近几条用户输入（旧到新），供意图识别参考
    pub fn recent_utterances(&self, n: usize) -> Vec<String> {
        let mut recent: Vec<String> = self
            .log
            .as_slice()
            .iter()
            .rev()
            .filter_map(|s| s.utterance.clone())
            .take(n)
            .collect();
        recent.reverse();
        recent
    }

    /// 新的 COMMAND 输入把会话置回 ACTIVE / COMMAND。
    /// BLOCKED 会话丢弃续接状态；待重试的动作被新输入取代，Replan 反馈保留给下一次规划
    pub fn reactivate(&mut self) {
        if self.status == SessionStatus::Blocked {
            self.last_state = None;
            self.directive = None;
        }
        if matches!(self.directive, Some(PendingDirective::Retry { .. })) {
            self.directive = None;
        }
        self.status = SessionStatus::Active;
        self.mode = SessionMode::Command;
        self.pending_question = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Action;
    use crate::perception::ElementId;
    use crate::sim::LoginSite;
    use std::sync::Arc;

    fn session(status: SessionStatus, directive: Option<PendingDirective>) -> Session {
        let page = Arc::new(LoginSite::new("alice", "secret"));
        let mut s = Session::new(
            new_session_id(),
            "log in",
            "http://site/login",
            SessionMode::Question,
            false,
            PageHandles::new(page.clone(), page),
            4,
        );
        s.status = status;
        s.directive = directive;
        s.last_state = Some(DecisionState::Failed);
        s.pending_question = Some("Which account?".into());
        s
    }

    fn retry() -> PendingDirective {
        PendingDirective::Retry {
            action: Action::click(ElementId::new("button-l")),
            attempt: 2,
        }
    }

    #[test]
    fn test_new_command_supersedes_pending_retry() {
        let mut s = session(SessionStatus::Active, Some(retry()));
        s.reactivate();
        assert_eq!(s.directive, None);
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.mode, SessionMode::Command);
        assert_eq!(s.last_state, Some(DecisionState::Failed));
        assert_eq!(s.pending_question, None);
    }

    #[test]
    fn test_replan_feedback_survives_reactivation() {
        let replan = PendingDirective::Replan { reason: "try the other button".into() };
        let mut s = session(SessionStatus::Active, Some(replan.clone()));
        s.reactivate();
        assert_eq!(s.directive, Some(replan));
    }

    #[test]
    fn test_blocked_session_starts_clean() {
        let replan = PendingDirective::Replan { reason: "x".into() };
        let mut s = session(SessionStatus::Blocked, Some(replan));
        s.reactivate();
        assert_eq!(s.directive, None);
        assert_eq!(s.last_state, None);
        assert_eq!(s.status, SessionStatus::Active);
    }
}
