//! 会话管理：对外的逐回合协议
//!
//! - `init` 创建会话并申请页面资源
//! - `next_action` 是创建后唯一的修改入口：每次调用恰好产生一条 Step
//! - 同一会话的并发调用由会话级互斥锁串行化，不同会话互不阻塞
//! - `close` 取消进行中的回合并释放资源

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::AppConfig;
use crate::core::{AgentError, SessionMode, SessionStatus, SessionSupervisor};
use crate::decision::{Action, AnswerInput, DecisionEngine, Intent, IntentClassifier, TurnInput};
use crate::session::session::{new_session_id, Session, SessionId};
use crate::session::{PageProvider, Step, TurnOutcome};

/// 意图识别参考的最近输入条数
const RECENT_UTTERANCES: usize = 4;

/// 一次回合请求
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub user_input: Option<String>,
    /// 覆盖配置中的回合超时
    pub timeout: Option<Duration>,
}

impl TurnRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.user_input = Some(input.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 一次回合的响应
#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub session_id: SessionId,
    /// 本回合追加的 Step 序号；未产生 Step 时为 None
    pub step_seq: Option<u64>,
    pub action: Option<Action>,
    pub status: SessionStatus,
    pub mode: SessionMode,
    pub message: String,
    pub answer: Option<String>,
}

/// 会话的只读视图
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub objective: String,
    pub start_url: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub turn: u64,
    pub knowledge_enabled: bool,
    pub pending_question: Option<String>,
    pub history: Vec<Step>,
}

struct SessionEntry {
    session: Mutex<Session>,
    supervisor: SessionSupervisor,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
    engine: Arc<DecisionEngine>,
    classifier: Arc<IntentClassifier>,
    provider: Arc<dyn PageProvider>,
    knowledge_by_default: bool,
    turn_timeout: Duration,
    idle_timeout: Duration,
    max_answer_history: usize,
}

impl SessionManager {
    pub fn new(
        engine: Arc<DecisionEngine>,
        classifier: Arc<IntentClassifier>,
        provider: Arc<dyn PageProvider>,
        config: &AppConfig,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            engine,
            classifier,
            provider,
            knowledge_by_default: config.knowledge.enabled_by_default,
            turn_timeout: Duration::from_secs(config.agent.turn_timeout_secs.max(1)),
            idle_timeout: Duration::from_secs(config.session.idle_timeout_secs),
            max_answer_history: config.session.max_answer_history,
        }
    }

    /// 创建会话；knowledge_enabled 为 None 时取配置默认值
    pub async fn init(
        &self,
        objective: &str,
        start_url: &str,
        knowledge_enabled: Option<bool>,
    ) -> Result<SessionId, AgentError> {
        let id = new_session_id();
        let handles = self
            .provider
            .acquire(&id, start_url)
            .await
            .map_err(|e| AgentError::PerceptionFailure(format!("could not open {start_url}: {e}")))?;

        let mode = match self.classifier.classify(objective, &[]).await {
            Intent::Command => SessionMode::Command,
            Intent::Question => SessionMode::Question,
        };
        let knowledge_enabled = knowledge_enabled.unwrap_or(self.knowledge_by_default);
        let session = Session::new(
            id.clone(),
            objective,
            start_url,
            mode,
            knowledge_enabled,
            handles,
            self.max_answer_history,
        );

        tracing::info!(session_id = %id, %mode, knowledge_enabled, "session initialized");
        self.sessions.write().await.insert(
            id.clone(),
            Arc::new(SessionEntry {
                session: Mutex::new(session),
                supervisor: SessionSupervisor::new(),
            }),
        );
        Ok(id)
    }

    /// 推进一个回合
    pub async fn next_action(
        &self,
        session_id: &str,
        user_input: Option<&str>,
    ) -> Result<TurnResponse, AgentError> {
        let request = TurnRequest {
            user_input: user_input.map(str::to_string),
            timeout: None,
        };
        self.next_action_with(session_id, request).await
    }

    pub async fn next_action_with(
        &self,
        session_id: &str,
        request: TurnRequest,
    ) -> Result<TurnResponse, AgentError> {
        let entry = self.entry(session_id).await?;
        let mut guard = entry.session.lock().await;
        let session = &mut *guard;

        if entry.supervisor.is_closed() {
            return Err(AgentError::SessionClosed(format!("session {session_id} was closed")));
        }
        if session.status.is_closed() {
            return Err(AgentError::SessionClosed(format!(
                "session {session_id} is {}",
                session.status
            )));
        }
        session.touch();
        let timeout = request.timeout.unwrap_or(self.turn_timeout);

        let utterance = request
            .user_input
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        match utterance {
            Some(text) => {
                let recent = session.recent_utterances(RECENT_UTTERANCES);
                let intent = self.classifier.classify(text, &recent).await;
                tracing::debug!(session_id, ?intent, "utterance classified");
                if intent == Intent::Question {
                    return self.answer(&entry, session, text, timeout, false).await;
                }
                session.reactivate();
            }
            None => match session.status {
                SessionStatus::AwaitingInput => {
                    let question = session.pending_question.clone().unwrap_or_default();
                    return Ok(TurnResponse {
                        session_id: session.id.clone(),
                        step_seq: None,
                        action: None,
                        status: session.status,
                        mode: session.mode,
                        message: question,
                        answer: None,
                    });
                }
                SessionStatus::Blocked => {
                    return Err(AgentError::SessionClosed(format!(
                        "session {session_id} is BLOCKED; send new input to continue"
                    )));
                }
                _ => {
                    if session.mode == SessionMode::Question {
                        let objective = session.objective.clone();
                        return self.answer(&entry, session, &objective, timeout, true).await;
                    }
                }
            },
        }

        let directive = session.directive.take();
        let output = self
            .engine
            .run_turn(TurnInput {
                session_id: &session.id,
                turn: session.turn + 1,
                objective: &session.objective,
                mode: session.mode,
                utterance,
                history: session.log.as_slice(),
                previous_state: session.last_state,
                directive,
                knowledge_enabled: session.knowledge_enabled,
                handles: &session.handles,
                timeout,
                cancel: entry.supervisor.turn_token(),
            })
            .await
            .map_err(|e| closed_on_cancel(e, session_id))?;

        session.turn += 1;
        session.status = output.status;
        session.last_state = output.final_state;
        session.directive = output.directive;
        session.pending_question = output.pending_question;
        let seq = session.log.append(output.step);
        tracing::info!(
            session_id,
            seq,
            status = %session.status,
            action = output.action.as_ref().map(|a| a.describe()).unwrap_or_default(),
            "turn finished"
        );

        Ok(TurnResponse {
            session_id: session.id.clone(),
            step_seq: Some(seq),
            action: output.action,
            status: session.status,
            mode: session.mode,
            message: output.message,
            answer: None,
        })
    }

    /// 问答路径：不校验、不执行，状态不变（QUESTION 模式下回答目标本身则结束会话）
    async fn answer(
        &self,
        entry: &SessionEntry,
        session: &mut Session,
        question: &str,
        timeout: Duration,
        completes: bool,
    ) -> Result<TurnResponse, AgentError> {
        let world_view = session.log.last_world_view().cloned();
        let mut step = self
            .engine
            .answer_turn(AnswerInput {
                session_id: &session.id,
                objective: &session.objective,
                question,
                world_view: world_view.as_deref(),
                transcript: &session.transcript,
                timeout,
                cancel: entry.supervisor.turn_token(),
            })
            .await
            .map_err(|e| closed_on_cancel(e, &session.id))?;

        let answer = step.answer.clone().unwrap_or_default();
        session.transcript.record(question, answer.clone());
        if completes {
            step.outcome = TurnOutcome::Done;
            session.status = SessionStatus::Done;
        }
        session.turn += 1;
        let seq = session.log.append(step);
        tracing::info!(session_id = %session.id, seq, status = %session.status, "question answered");

        Ok(TurnResponse {
            session_id: session.id.clone(),
            step_seq: Some(seq),
            action: None,
            status: session.status,
            mode: session.mode,
            message: answer.clone(),
            answer: Some(answer),
        })
    }

    /// 关闭会话：取消进行中的回合并释放页面资源
    pub async fn close(&self, session_id: &str) -> Result<(), AgentError> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        entry.supervisor.close();
        self.provider.release(session_id).await;
        tracing::info!(session_id, "session closed");
        Ok(())
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, AgentError> {
        let entry = self.entry(session_id).await?;
        let session = entry.session.lock().await;
        Ok(SessionSnapshot {
            id: session.id.clone(),
            objective: session.objective.clone(),
            start_url: session.start_url.clone(),
            mode: session.mode,
            status: session.status,
            turn: session.turn,
            knowledge_enabled: session.knowledge_enabled,
            pending_question: session.pending_question.clone(),
            history: session.log.as_slice().to_vec(),
        })
    }

    /// 关闭空闲超时的会话；正在进行回合的会话跳过
    pub async fn cleanup_expired(&self) -> usize {
        let expired: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .session
                        .try_lock()
                        .map(|s| s.is_expired(self.idle_timeout))
                        .unwrap_or(false)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut closed = 0;
        for id in &expired {
            if self.close(id).await.is_ok() {
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::info!(closed, "expired sessions cleaned up");
        }
        closed
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn entry(&self, session_id: &str) -> Result<Arc<SessionEntry>, AgentError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))
    }
}

fn closed_on_cancel(error: AgentError, session_id: &str) -> AgentError {
    match error {
        AgentError::Cancelled => {
            AgentError::SessionClosed(format!("session {session_id} was closed during the turn"))
        }
        other => other,
    }
}
