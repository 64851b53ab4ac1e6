//! 决策引擎：单个回合的显式状态机
//!
//! 一回合 = 感知 → 知识融合 → 提案 → 校验（被拒则带原因重新提案）→ 执行 → 恢复决策。
//! 每一步都通过 StateTrace 按转移表推进；回合产出一条完整的 Step，由会话层追加到历史。
//! 整个回合受截止时间与会话取消令牌约束：超时作为一次 Timeout 失败交给恢复策略，
//! 取消则直接返回 Cancelled，不再执行任何动作。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AgentSection;
use crate::core::{
    recovery::prior_attempts, AgentError, DecisionState, FailureKind, RecoveryDecision,
    RecoveryStrategy, Rejection, SessionMode, SessionStatus, StateTrace,
};
use crate::decision::events::send_event;
use crate::decision::{
    rank_candidates, Action, ActionKind, ActionProposer, Candidate, ContextSignals,
    DecisionContext, DecisionEvent, Intent, Proposal, StepDigest, Validator, Verdict,
};
use crate::execution::execute_audited;
use crate::knowledge::{KnowledgeFuser, QuestionAnswerer};
use crate::llm::Transcript;
use crate::perception::{WorldView, WorldViewBuilder};
use crate::session::{ExecutionResult, PageHandles, Step, TurnOutcome};

/// 恢复策略留给下一回合的指令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum PendingDirective {
    /// 对新的 WorldView 重新执行同一动作
    Retry { action: Action, attempt: u32 },
    /// 换一个动作，reason 作为提案反馈
    Replan { reason: String },
}

/// 命令回合的输入（借用会话状态）
pub struct TurnInput<'a> {
    pub session_id: &'a str,
    pub turn: u64,
    pub objective: &'a str,
    pub mode: SessionMode,
    pub utterance: Option<&'a str>,
    pub history: &'a [Step],
    pub previous_state: Option<DecisionState>,
    pub directive: Option<PendingDirective>,
    pub knowledge_enabled: bool,
    pub handles: &'a PageHandles,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// 命令回合的结果
#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub step: Step,
    pub status: SessionStatus,
    pub action: Option<Action>,
    pub message: String,
    pub directive: Option<PendingDirective>,
    pub pending_question: Option<String>,
    pub final_state: Option<DecisionState>,
}

/// 问答回合的输入
pub struct AnswerInput<'a> {
    pub session_id: &'a str,
    pub objective: &'a str,
    pub question: &'a str,
    pub world_view: Option<&'a WorldView>,
    pub transcript: &'a Transcript,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// 回合进行中的可变记录；超时后仍可读取已完成的部分
struct TurnProgress {
    trace: StateTrace,
    step: Step,
    executing: Option<Action>,
    started: Instant,
}

impl TurnProgress {
    fn new(previous: Option<DecisionState>, utterance: Option<&str>) -> Self {
        let mut step = Step::empty();
        step.utterance = utterance.map(str::to_string);
        step.intent = utterance.map(|_| Intent::Command);
        Self {
            trace: StateTrace::resume(previous),
            step,
            executing: None,
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

pub struct DecisionEngine {
    builder: WorldViewBuilder,
    fuser: KnowledgeFuser,
    proposer: Arc<dyn ActionProposer>,
    validator: Validator,
    recovery: RecoveryStrategy,
    answerer: QuestionAnswerer,
    max_reproposals: u32,
    history_window: usize,
    event_tx: Option<UnboundedSender<DecisionEvent>>,
}

impl DecisionEngine {
    pub fn new(
        builder: WorldViewBuilder,
        fuser: KnowledgeFuser,
        proposer: Arc<dyn ActionProposer>,
        validator: Validator,
        recovery: RecoveryStrategy,
        answerer: QuestionAnswerer,
        agent: &AgentSection,
    ) -> Self {
        Self {
            builder,
            fuser,
            proposer,
            validator,
            recovery,
            answerer,
            max_reproposals: agent.max_reproposals,
            history_window: agent.history_window.max(1),
            event_tx: None,
        }
    }

    /// 订阅决策事件
    pub fn with_event_tx(mut self, tx: UnboundedSender<DecisionEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn recovery(&self) -> &RecoveryStrategy {
        &self.recovery
    }

    /// 运行一个命令回合
    pub async fn run_turn(&self, input: TurnInput<'_>) -> Result<TurnOutput, AgentError> {
        let mut progress = TurnProgress::new(input.previous_state, input.utterance);
        progress.trace.advance(DecisionState::Planning)?;
        send_event(
            &self.event_tx,
            DecisionEvent::TurnStarted {
                session_id: input.session_id.to_string(),
                turn: input.turn,
            },
        );

        let deadline = tokio::time::Instant::now() + input.timeout;
        let outcome = tokio::select! {
            biased;
            _ = input.cancel.cancelled() => return Err(AgentError::Cancelled),
            r = tokio::time::timeout_at(deadline, self.drive(&input, &mut progress)) => r,
        };

        let result = match outcome {
            Ok(r) => r,
            Err(_) => Err(AgentError::Timeout(input.timeout)),
        };

        match result {
            Ok(out) => Ok(out),
            Err(e) => match e.failure_kind() {
                Some(kind) => self.fail_turn(&input, progress, kind, e.to_string()),
                None if matches!(e, AgentError::LlmError(_) | AgentError::JsonParseError(_)) => {
                    self.fault(&input, progress, e)
                }
                None => Err(e),
            },
        }
    }

    async fn drive(
        &self,
        input: &TurnInput<'_>,
        progress: &mut TurnProgress,
    ) -> Result<TurnOutput, AgentError> {
        let history = input.history;

        let world_view = Arc::new(self.builder.build(input.handles.source.as_ref()).await?);
        let page_changed = history
            .iter()
            .rev()
            .find_map(|s| s.world_view.as_ref())
            .map_or(true, |prev| prev.fingerprint() != world_view.fingerprint());
        progress.step.world_view = Some(world_view.clone());
        send_event(
            &self.event_tx,
            DecisionEvent::WorldViewBuilt {
                elements: world_view.elements.len(),
                page_changed,
            },
        );

        let fused = self
            .fuser
            .fuse(input.knowledge_enabled, input.objective, input.utterance)
            .await;
        progress.step.knowledge = fused.status.clone();
        send_event(
            &self.event_tx,
            DecisionEvent::Knowledge {
                status: fused.status.clone(),
            },
        );

        let window_start = history.len().saturating_sub(self.history_window);
        let mut ctx = DecisionContext {
            objective: input.objective.to_string(),
            mode: input.mode,
            utterance: input.utterance.map(str::to_string),
            world_view: world_view.clone(),
            knowledge: fused.context,
            history: history[window_start..].iter().map(StepDigest::from_step).collect(),
            feedback: Vec::new(),
            // 新指令意味着用户要求重新尝试
            avoid: match input.utterance {
                Some(_) => Vec::new(),
                None => failure_run_actions(history),
            },
            page_changed,
        };

        let signals = ContextSignals {
            fresh_utterance: input.utterance.is_some(),
            retry_sanctioned: false,
        };

        // 新的用户输入优先于上一回合留下的恢复指令
        let mut pending: Option<Proposal> = None;
        match (&input.directive, input.utterance) {
            (Some(PendingDirective::Retry { action, attempt }), None) => {
                pending = Some(Proposal {
                    candidates: vec![Candidate::new(action.clone().observed_on(&world_view))],
                    rationale: Some(format!(
                        "Retrying {} (attempt {})",
                        action.describe(),
                        attempt
                    )),
                    verdict: Verdict::Proceed,
                });
            }
            (Some(PendingDirective::Replan { reason }), _) => ctx.feedback.push(reason.clone()),
            _ => {}
        }

        let mut reproposals = 0u32;
        loop {
            let (proposal, is_retry) = match pending.take() {
                Some(p) => (p, true),
                None => match self.proposer.propose(&ctx).await {
                    Ok(p) => (p, false),
                    Err(AgentError::JsonParseError(detail))
                        if reproposals < self.max_reproposals =>
                    {
                        reproposals += 1;
                        tracing::warn!(detail = %detail, reproposals, "unparseable proposal, asking again");
                        ctx.feedback.push(format!(
                            "Your previous reply could not be parsed ({detail}). Answer in the required JSON format."
                        ));
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            progress.trace.advance(DecisionState::ActionProposed)?;
            progress.step.rationale = proposal.rationale.clone();

            if let Verdict::Fail(reason) = proposal.verdict {
                progress.trace.advance(DecisionState::Blocked)?;
                return Ok(self.finish(progress, TurnOutcome::Blocked, SessionStatus::Blocked, reason, None, None));
            }

            let mut chosen = None;
            for candidate in rank_candidates(proposal.candidates, &world_view, history) {
                send_event(
                    &self.event_tx,
                    DecisionEvent::Proposed {
                        action: candidate.action.describe(),
                        rationale: progress.step.rationale.clone(),
                    },
                );
                let signals = ContextSignals {
                    retry_sanctioned: is_retry,
                    ..signals
                };
                match self
                    .validator
                    .validate(&candidate.action, &world_view, history, input.mode, signals)
                {
                    Ok(()) => {
                        chosen = Some(candidate.action);
                        break;
                    }
                    Err(rejection) => {
                        self.note_rejection(&mut ctx, &candidate.action, &rejection);
                        progress.step.validation.rejections.push(rejection);
                    }
                }
            }

            let Some(action) = chosen else {
                if reproposals >= self.max_reproposals {
                    progress.trace.advance(DecisionState::Blocked)?;
                    let message = format!(
                        "No valid action after {} proposal(s): {}",
                        reproposals + 1,
                        rejection_summary(&progress.step.validation.rejections)
                    );
                    return Ok(self.finish(progress, TurnOutcome::Blocked, SessionStatus::Blocked, message, None, None));
                }
                reproposals += 1;
                progress.trace.advance(DecisionState::Planning)?;
                continue;
            };

            progress.step.validation.accepted = true;
            progress.trace.advance(DecisionState::Validated)?;
            progress.step.retry_count = prior_attempts(Some(&action), history);
            progress.step.action = Some(action.clone());

            return match action.kind {
                ActionKind::Finish => {
                    progress.trace.advance(DecisionState::Done)?;
                    let message = action
                        .payload
                        .clone()
                        .or_else(|| progress.step.rationale.clone())
                        .unwrap_or_else(|| "Objective complete.".to_string());
                    Ok(self.finish(progress, TurnOutcome::Done, SessionStatus::Done, message, None, None))
                }
                ActionKind::AskUser => {
                    progress.trace.advance(DecisionState::AwaitingInput)?;
                    let question = action.payload.clone().unwrap_or_default();
                    Ok(self.finish(
                        progress,
                        TurnOutcome::AwaitingInput,
                        SessionStatus::AwaitingInput,
                        question.clone(),
                        None,
                        Some(question),
                    ))
                }
                _ => {
                    progress.executing = Some(action.clone());
                    let result =
                        execute_audited(input.handles.executor.as_ref(), &action, input.session_id)
                            .await;
                    progress.executing = None;
                    progress.trace.advance(DecisionState::Executed)?;
                    send_event(
                        &self.event_tx,
                        DecisionEvent::Executed {
                            action: action.describe(),
                            success: result.success,
                            detail: result.error_detail.clone(),
                        },
                    );
                    let success = result.success;
                    progress.step.execution = Some(result);
                    if success {
                        progress.trace.advance(DecisionState::Succeeded)?;
                        let message = format!("Executed {}.", action.describe());
                        Ok(self.finish(progress, TurnOutcome::Succeeded, SessionStatus::Active, message, None, None))
                    } else {
                        progress.trace.advance(DecisionState::Failed)?;
                        self.recover(input, progress)
                    }
                }
            };
        }
    }

    fn note_rejection(&self, ctx: &mut DecisionContext, action: &Action, rejection: &Rejection) {
        tracing::info!(action = %action.describe(), reason = rejection.label(), "candidate rejected");
        send_event(
            &self.event_tx,
            DecisionEvent::Rejected {
                action: action.describe(),
                reason: rejection.to_string(),
            },
        );
        ctx.feedback
            .push(format!("Rejected {}: {}", action.describe(), rejection));
        ctx.avoid.push(action.clone());
    }

    /// 感知失败或超时：记为失败 Step 并交给恢复策略
    fn fail_turn(
        &self,
        input: &TurnInput<'_>,
        mut progress: TurnProgress,
        kind: FailureKind,
        detail: String,
    ) -> Result<TurnOutput, AgentError> {
        tracing::warn!(session_id = input.session_id, ?kind, detail = %detail, "turn failed");
        if let Some(action) = progress.executing.take() {
            progress.step.action = Some(action);
        }
        let elapsed = progress.elapsed_ms();
        progress.step.execution = Some(ExecutionResult::failed(kind, detail, elapsed));

        match progress.trace.current() {
            Some(DecisionState::ActionProposed) => {
                progress.trace.advance(DecisionState::Planning)?;
                progress.trace.advance(DecisionState::Failed)?;
            }
            Some(DecisionState::Executed) => progress.trace.advance(DecisionState::Failed)?,
            Some(DecisionState::Planning) | Some(DecisionState::Validated) => {
                progress.trace.advance(DecisionState::Failed)?
            }
            _ => {}
        }
        self.recover(input, &mut progress)
    }

    fn recover(
        &self,
        input: &TurnInput<'_>,
        progress: &mut TurnProgress,
    ) -> Result<TurnOutput, AgentError> {
        let decision = self.recovery.decide(&progress.step, input.history);
        progress.step.retry_count = prior_attempts(progress.step.action.as_ref(), input.history);
        progress.step.recovery = Some(decision.clone());
        send_event(
            &self.event_tx,
            DecisionEvent::Recovery {
                decision: decision.clone(),
            },
        );

        let detail = progress
            .step
            .failure_detail()
            .unwrap_or("unknown error")
            .to_string();
        let bound = self.recovery.policy().retry_bound;
        match decision {
            RecoveryDecision::Retry { attempt } => {
                let directive = progress
                    .step
                    .action
                    .clone()
                    .map(|action| PendingDirective::Retry { action, attempt });
                let message = match &progress.step.action {
                    Some(a) => format!(
                        "{} failed: {}. Retrying (attempt {} of {}).",
                        a.describe(),
                        detail,
                        attempt,
                        bound
                    ),
                    None => format!("Turn failed: {}. Trying again.", detail),
                };
                Ok(self.finish(progress, TurnOutcome::Failed, SessionStatus::Active, message, directive, None))
            }
            RecoveryDecision::Replan { reason } => {
                let directive = Some(PendingDirective::Replan {
                    reason: reason.clone(),
                });
                Ok(self.finish(progress, TurnOutcome::Failed, SessionStatus::Active, reason, directive, None))
            }
            RecoveryDecision::Abort { reason } => {
                progress.trace.advance(DecisionState::Blocked)?;
                Ok(self.finish(progress, TurnOutcome::Blocked, SessionStatus::Blocked, reason, None, None))
            }
        }
    }

    /// 提案方不可用：会话进入 FAILED
    fn fault(
        &self,
        input: &TurnInput<'_>,
        mut progress: TurnProgress,
        error: AgentError,
    ) -> Result<TurnOutput, AgentError> {
        tracing::error!(session_id = input.session_id, error = %error, "decision service failed");
        if progress.trace.current() == Some(DecisionState::ActionProposed) {
            progress.trace.advance(DecisionState::Planning)?;
        }
        progress.trace.advance(DecisionState::Faulted)?;
        let message = format!("The decision service failed: {}", error);
        Ok(self.finish(&mut progress, TurnOutcome::Faulted, SessionStatus::Failed, message, None, None))
    }

    fn finish(
        &self,
        progress: &mut TurnProgress,
        outcome: TurnOutcome,
        status: SessionStatus,
        message: String,
        directive: Option<PendingDirective>,
        pending_question: Option<String>,
    ) -> TurnOutput {
        progress.step.trace = progress.trace.visited().to_vec();
        progress.step.outcome = outcome;
        progress.step.message = message.clone();
        send_event(
            &self.event_tx,
            DecisionEvent::TurnFinished {
                status,
                message: message.clone(),
            },
        );
        TurnOutput {
            step: progress.step.clone(),
            status,
            action: progress.step.action.clone(),
            message,
            directive,
            pending_question,
            final_state: progress.trace.current(),
        }
    }

    /// 问答回合：总是检索知识，不经过校验与执行
    pub async fn answer_turn(&self, input: AnswerInput<'_>) -> Result<Step, AgentError> {
        let deadline = tokio::time::Instant::now() + input.timeout;
        let work = async {
            let fused = self.fuser.fuse_question(input.objective, input.question).await;
            send_event(
                &self.event_tx,
                DecisionEvent::Knowledge {
                    status: fused.status.clone(),
                },
            );
            let answer = self
                .answerer
                .answer(
                    input.question,
                    fused.context.as_ref(),
                    input.world_view,
                    input.transcript,
                )
                .await;
            (fused.status, answer)
        };

        let (knowledge, answer) = tokio::select! {
            biased;
            _ = input.cancel.cancelled() => return Err(AgentError::Cancelled),
            r = tokio::time::timeout_at(deadline, work) => match r {
                Ok(done) => done,
                Err(_) => {
                    tracing::warn!(session_id = input.session_id, "answer timed out");
                    (
                        crate::knowledge::KnowledgeStatus::Unavailable {
                            reason: format!("timed out after {:?}", input.timeout),
                        },
                        "I could not produce an answer in time.".to_string(),
                    )
                }
            },
        };

        send_event(
            &self.event_tx,
            DecisionEvent::Answered {
                preview: answer.chars().take(80).collect(),
            },
        );

        let mut step = Step::empty();
        step.utterance = Some(input.question.to_string());
        step.intent = Some(Intent::Question);
        step.knowledge = knowledge;
        step.outcome = TurnOutcome::Answered;
        step.answer = Some(answer.clone());
        step.message = answer;
        Ok(step)
    }
}

/// 当前失败段里失败过的动作（去重）；失败段止于最近一次成功或带用户输入的 Step
fn failure_run_actions(history: &[Step]) -> Vec<Action> {
    let mut actions: Vec<Action> = Vec::new();
    for step in history.iter().rev() {
        match &step.execution {
            None => continue,
            Some(e) if e.success => break,
            Some(_) => {
                if let Some(a) = &step.action {
                    if !actions.iter().any(|x| x.same_intent(a)) {
                        actions.push(a.clone());
                    }
                }
                if step.utterance.is_some() {
                    break;
                }
            }
        }
    }
    actions
}

fn rejection_summary(rejections: &[Rejection]) -> String {
    if rejections.is_empty() {
        return "the proposer returned no candidates".to_string();
    }
    rejections
        .iter()
        .rev()
        .take(3)
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::config::{AgentSection, KnowledgeSection};
    use crate::core::RecoveryPolicy;
    use crate::decision::ModePolicy;
    use crate::execution::{ActionExecutor, ExecutionReport};
    use crate::llm::LlmError;
    use crate::perception::{ElementId, PageSource, RawElement, RawPage};

    struct StaticPage;

    #[async_trait]
    impl PageSource for StaticPage {
        async fn read_page(&self) -> Result<RawPage, String> {
            Ok(RawPage {
                url: "https://example.test/login".into(),
                title: "Login".into(),
                elements: vec![
                    RawElement::new("button").with_text("Log in"),
                    RawElement::new("a").with_text("Help"),
                ],
                screenshot: None,
            })
        }
    }

    struct BrokenPage;

    #[async_trait]
    impl PageSource for BrokenPage {
        async fn read_page(&self) -> Result<RawPage, String> {
            Err("tab crashed".into())
        }
    }

    struct Executor {
        succeed: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ActionExecutor for Executor {
        async fn execute(&self, _action: &Action) -> ExecutionReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                ExecutionReport::ok()
            } else {
                ExecutionReport::failed("element did not respond")
            }
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl ActionExecutor for SlowExecutor {
        async fn execute(&self, _action: &Action) -> ExecutionReport {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ExecutionReport::ok()
        }
    }

    /// 依次返回预设的提案；提案里的动作会被盖上当前 WorldView 的指纹
    struct Scripted {
        proposals: Mutex<Vec<Result<Vec<Action>, AgentError>>>,
        contexts: Mutex<Vec<DecisionContext>>,
    }

    impl Scripted {
        fn new(mut proposals: Vec<Result<Vec<Action>, AgentError>>) -> Self {
            proposals.reverse();
            Self {
                proposals: Mutex::new(proposals),
                contexts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ActionProposer for Scripted {
        async fn propose(&self, ctx: &DecisionContext) -> Result<Proposal, AgentError> {
            self.contexts.lock().unwrap().push(ctx.clone());
            let next = self
                .proposals
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(vec![Action::finish("done")]));
            let actions = next?;
            Ok(Proposal {
                candidates: actions
                    .into_iter()
                    .map(|a| Candidate::new(a.observed_on(&ctx.world_view)))
                    .collect(),
                rationale: Some("scripted".into()),
                verdict: Verdict::Proceed,
            })
        }
    }

    fn engine(proposer: Arc<dyn ActionProposer>) -> DecisionEngine {
        engine_with(proposer, AgentSection::default())
    }

    fn engine_with(proposer: Arc<dyn ActionProposer>, agent: AgentSection) -> DecisionEngine {
        DecisionEngine::new(
            WorldViewBuilder::new(50),
            KnowledgeFuser::new(None, &KnowledgeSection::default()),
            proposer,
            Validator::new(ModePolicy::from_config(&agent)),
            RecoveryStrategy::new(RecoveryPolicy::from_config(&agent)),
            QuestionAnswerer::new(None),
            &agent,
        )
    }

    fn handles(source: Arc<dyn PageSource>, executor: Arc<dyn ActionExecutor>) -> PageHandles {
        PageHandles::new(source, executor)
    }

    fn input<'a>(history: &'a [Step], handles: &'a PageHandles) -> TurnInput<'a> {
        TurnInput {
            session_id: "s1",
            turn: history.len() as u64 + 1,
            objective: "log in",
            mode: SessionMode::Command,
            utterance: None,
            history,
            previous_state: history.last().and_then(|s| s.trace.last().copied()),
            directive: None,
            knowledge_enabled: false,
            handles,
            timeout: Duration::from_secs(2),
            cancel: CancellationToken::new(),
        }
    }

    async fn login_button() -> ElementId {
        let wv = WorldViewBuilder::new(50).build(&StaticPage).await.unwrap();
        wv.find_by_label("Log in").unwrap().id.clone()
    }

    #[tokio::test]
    async fn test_successful_click_walks_full_trace() {
        let button = login_button().await;
        let proposer = Arc::new(Scripted::new(vec![Ok(vec![Action::click(button)])]));
        let exec = Arc::new(Executor { succeed: true, calls: AtomicUsize::new(0) });
        let h = handles(Arc::new(StaticPage), exec.clone());
        let out = engine(proposer).run_turn(input(&[], &h)).await.unwrap();

        assert_eq!(out.status, SessionStatus::Active);
        assert_eq!(out.step.outcome, TurnOutcome::Succeeded);
        assert_eq!(
            out.step.trace,
            vec![
                DecisionState::Planning,
                DecisionState::ActionProposed,
                DecisionState::Validated,
                DecisionState::Executed,
                DecisionState::Succeeded
            ]
        );
        assert!(out.step.world_view.is_some());
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_candidate_feeds_back_into_next_proposal() {
        let button = login_button().await;
        let proposer = Arc::new(Scripted::new(vec![
            Ok(vec![Action::click(ElementId::new("button-deadbeef"))]),
            Ok(vec![Action::click(button)]),
        ]));
        let exec = Arc::new(Executor { succeed: true, calls: AtomicUsize::new(0) });
        let h = handles(Arc::new(StaticPage), exec.clone());
        let out = engine(proposer.clone()).run_turn(input(&[], &h)).await.unwrap();

        assert_eq!(out.step.outcome, TurnOutcome::Succeeded);
        assert_eq!(out.step.validation.rejections.len(), 1);
        assert_eq!(out.step.validation.rejections[0].label(), "target_not_found");
        let contexts = proposer.contexts.lock().unwrap();
        assert_eq!(contexts.len(), 2);
        assert!(contexts[1].feedback.iter().any(|f| f.contains("not present")));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_command_policy_rejects_excluded_kind() {
        let button = login_button().await;
        let proposer = Arc::new(Scripted::new(vec![
            Ok(vec![Action::navigate("http://elsewhere/")]),
            Ok(vec![Action::click(button)]),
        ]));
        let exec = Arc::new(Executor { succeed: true, calls: AtomicUsize::new(0) });
        let h = handles(Arc::new(StaticPage), exec.clone());
        let mut agent = AgentSection::default();
        agent.command_actions.retain(|k| *k != ActionKind::Navigate);
        let out = engine_with(proposer, agent).run_turn(input(&[], &h)).await.unwrap();

        assert_eq!(out.step.outcome, TurnOutcome::Succeeded);
        assert_eq!(
            out.step.validation.rejections,
            vec![Rejection::DisallowedInMode {
                kind: ActionKind::Navigate,
                mode: SessionMode::Command
            }]
        );
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_reproposals_block_without_executing() {
        let bogus = || Ok(vec![Action::click(ElementId::new("button-00000000"))]);
        let proposer = Arc::new(Scripted::new(vec![bogus(), bogus(), bogus()]));
        let exec = Arc::new(Executor { succeed: true, calls: AtomicUsize::new(0) });
        let h = handles(Arc::new(StaticPage), exec.clone());
        let out = engine(proposer).run_turn(input(&[], &h)).await.unwrap();

        assert_eq!(out.status, SessionStatus::Blocked);
        assert_eq!(out.final_state, Some(DecisionState::Blocked));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_execution_schedules_retry() {
        let button = login_button().await;
        let proposer = Arc::new(Scripted::new(vec![Ok(vec![Action::click(button.clone())])]));
        let exec = Arc::new(Executor { succeed: false, calls: AtomicUsize::new(0) });
        let h = handles(Arc::new(StaticPage), exec);
        let out = engine(proposer).run_turn(input(&[], &h)).await.unwrap();

        assert_eq!(out.status, SessionStatus::Active);
        assert_eq!(out.step.outcome, TurnOutcome::Failed);
        assert!(matches!(out.step.recovery, Some(RecoveryDecision::Retry { attempt: 2 })));
        match out.directive {
            Some(PendingDirective::Retry { action, .. }) => assert_eq!(action.target, Some(button)),
            other => panic!("Expected retry directive, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_directive_bypasses_proposer() {
        let button = login_button().await;
        let proposer = Arc::new(Scripted::new(vec![Ok(vec![Action::click(button.clone())])]));
        let exec = Arc::new(Executor { succeed: false, calls: AtomicUsize::new(0) });
        let h = handles(Arc::new(StaticPage), exec.clone());
        let eng = engine(proposer.clone());

        let first = eng.run_turn(input(&[], &h)).await.unwrap();
        let mut step = first.step;
        step.seq = 1;
        let history = vec![step];
        let mut second_input = input(&history, &h);
        second_input.directive = first.directive;
        let second = eng.run_turn(second_input).await.unwrap();

        assert_eq!(proposer.contexts.lock().unwrap().len(), 1);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.step.retry_count, 1);
        assert!(matches!(second.step.recovery, Some(RecoveryDecision::Replan { .. })));
    }

    #[tokio::test]
    async fn test_perception_failure_is_recorded_and_recovered() {
        let proposer = Arc::new(Scripted::new(vec![]));
        let exec = Arc::new(Executor { succeed: true, calls: AtomicUsize::new(0) });
        let h = handles(Arc::new(BrokenPage), exec);
        let out = engine(proposer).run_turn(input(&[], &h)).await.unwrap();

        assert_eq!(out.step.outcome, TurnOutcome::Failed);
        assert_eq!(
            out.step.execution.as_ref().and_then(|e| e.failure),
            Some(FailureKind::Perception)
        );
        assert!(out.step.world_view.is_none());
        assert_eq!(out.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_timeout_during_execution_counts_as_failure() {
        let button = login_button().await;
        let proposer = Arc::new(Scripted::new(vec![Ok(vec![Action::click(button)])]));
        let h = handles(Arc::new(StaticPage), Arc::new(SlowExecutor));
        let mut turn = input(&[], &h);
        turn.timeout = Duration::from_millis(50);
        let out = engine(proposer).run_turn(turn).await.unwrap();

        assert_eq!(
            out.step.execution.as_ref().and_then(|e| e.failure),
            Some(FailureKind::Timeout)
        );
        assert!(out.step.action.is_some());
        assert_eq!(out.step.trace.last(), Some(&DecisionState::Failed));
    }

    #[tokio::test]
    async fn test_cancelled_turn_returns_error() {
        let proposer = Arc::new(Scripted::new(vec![]));
        let h = handles(Arc::new(StaticPage), Arc::new(SlowExecutor));
        let mut turn = input(&[], &h);
        let token = CancellationToken::new();
        token.cancel();
        turn.cancel = token;
        let result = engine(proposer).run_turn(turn).await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_llm_failure_faults_session() {
        let proposer = Arc::new(Scripted::new(vec![Err(AgentError::LlmError(LlmError::Timeout))]));
        let exec = Arc::new(Executor { succeed: true, calls: AtomicUsize::new(0) });
        let h = handles(Arc::new(StaticPage), exec);
        let out = engine(proposer).run_turn(input(&[], &h)).await.unwrap();
        assert_eq!(out.status, SessionStatus::Failed);
        assert_eq!(out.step.outcome, TurnOutcome::Faulted);
        assert_eq!(out.final_state, Some(DecisionState::Faulted));
    }

    #[tokio::test]
    async fn test_finish_and_ask_user_do_not_execute() {
        let exec = Arc::new(Executor { succeed: true, calls: AtomicUsize::new(0) });
        let h = handles(Arc::new(StaticPage), exec.clone());

        let ask = Arc::new(Scripted::new(vec![Ok(vec![Action::ask_user("Which account?")])]));
        let out = engine(ask).run_turn(input(&[], &h)).await.unwrap();
        assert_eq!(out.status, SessionStatus::AwaitingInput);
        assert_eq!(out.pending_question.as_deref(), Some("Which account?"));

        let finish = Arc::new(Scripted::new(vec![Ok(vec![Action::finish("Logged in")])]));
        let out = engine(finish).run_turn(input(&[], &h)).await.unwrap();
        assert_eq!(out.status, SessionStatus::Done);
        assert_eq!(out.message, "Logged in");
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_answer_turn_without_knowledge() {
        let proposer = Arc::new(Scripted::new(vec![]));
        let transcript = Transcript::new(5);
        let step = engine(proposer)
            .answer_turn(AnswerInput {
                session_id: "s1",
                objective: "log in",
                question: "How do I reset my password?",
                world_view: None,
                transcript: &transcript,
                timeout: Duration::from_secs(1),
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(step.outcome, TurnOutcome::Answered);
        assert!(step.action.is_none());
        assert!(step.knowledge.is_degraded());
        assert_eq!(step.answer.as_deref(), Some(crate::knowledge::NO_KNOWLEDGE_ANSWER));
    }
}
