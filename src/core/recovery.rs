//! 失败恢复策略
//!
//! 根据失败的 Step 与历史决定 Retry / Replan / Abort。
//! 计数全部从只追加的历史中推导：最近一次成功之后的连续失败构成一个「失败段」。
//! 计数依据段内已记录的恢复决策而不是动作本身：自上一次 Replan 以来的尝试次数决定是否重试，
//! 段内 Replan 的次数决定是否放弃。没有动作的失败（感知失败、提案前超时）同样计数，
//! 因此始终失败时最多执行 retry_bound × replan_bound 步。
//! 带用户输入的失败 Step 是失败段的起点：新的指令重新获得完整的重试预算。

use serde::{Deserialize, Serialize};

use crate::config::AgentSection;
use crate::decision::Action;
use crate::session::Step;

/// 放弃原因里最多引用的失败条数
const MAX_REASON_FAILURES: usize = 4;

/// 重试 / 重新规划上限（来自配置）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// 同一动作最多尝试次数（含首次）
    pub retry_bound: u32,
    /// 一个失败段内最多经历的规划轮数（Replan 次数 + 1）
    pub replan_bound: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            retry_bound: 2,
            replan_bound: 3,
        }
    }
}

impl RecoveryPolicy {
    pub fn from_config(agent: &AgentSection) -> Self {
        Self {
            retry_bound: agent.retry_bound.max(1),
            replan_bound: agent.replan_bound.max(1),
        }
    }

    /// 始终失败时最多执行的步数
    pub fn max_failed_steps(&self) -> u32 {
        self.retry_bound * self.replan_bound
    }
}

/// 恢复决策
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RecoveryDecision {
    /// 对新的 WorldView 重新执行同一动作；attempt 为即将进行的第几次尝试
    Retry { attempt: u32 },
    /// 带着失败原因回到规划，要求换一个动作
    Replan { reason: String },
    /// 放弃，会话进入 BLOCKED
    Abort { reason: String },
}

/// 恢复策略：只读历史，不持有可变状态
#[derive(Debug, Default, Clone)]
pub struct RecoveryStrategy {
    policy: RecoveryPolicy,
}

impl RecoveryStrategy {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RecoveryPolicy {
        self.policy
    }

    /// `failed` 是本回合刚失败、尚未追加的 Step；`history` 是此前的全部 Step
    pub fn decide(&self, failed: &Step, history: &[Step]) -> RecoveryDecision {
        let run = failure_run(failed, history);
        let attempts = attempts_since_replan(&run);
        let replans = replans_in_run(&run);

        if (run.len() as u32) < self.policy.max_failed_steps() {
            if attempts < self.policy.retry_bound {
                tracing::debug!(attempts, replans, "recovery: retry");
                return RecoveryDecision::Retry {
                    attempt: attempts + 1,
                };
            }
            if replans + 1 < self.policy.replan_bound {
                tracing::debug!(attempts, replans, "recovery: replan");
                return RecoveryDecision::Replan {
                    reason: format!(
                        "{} failed {} time(s): {}. Choose a different action.",
                        describe(failed.action.as_ref()),
                        attempts,
                        failed.failure_detail().unwrap_or("unknown error")
                    ),
                };
            }
        }
        tracing::info!(attempts, replans, run = run.len(), "recovery: abort");
        RecoveryDecision::Abort {
            reason: abort_reason(&run, replans),
        }
    }
}

/// 本动作在历史末尾已经连续失败的次数（不含当前这次）
pub fn prior_attempts(action: Option<&Action>, history: &[Step]) -> u32 {
    let mut count = 0;
    for step in history.iter().rev() {
        let Some(exec) = &step.execution else { continue };
        if exec.success || !same_action(step.action.as_ref(), action) {
            break;
        }
        count += 1;
        if step.utterance.is_some() {
            break;
        }
    }
    count
}

/// 失败段（新到旧）：当前失败 + 历史中最近一次成功之后的所有失败执行；没有执行结果的 Step 跳过
fn failure_run<'a>(failed: &'a Step, history: &'a [Step]) -> Vec<&'a Step> {
    let mut run = vec![failed];
    if failed.utterance.is_some() {
        return run;
    }
    for step in history.iter().rev() {
        match &step.execution {
            None => continue,
            Some(exec) if exec.success => break,
            Some(_) => {
                run.push(step);
                if step.utterance.is_some() {
                    break;
                }
            }
        }
    }
    run
}

/// 当前这次加上此前紧邻的、被决定为 Retry 的失败
fn attempts_since_replan(run: &[&Step]) -> u32 {
    1 + run[1..]
        .iter()
        .take_while(|s| matches!(s.recovery, Some(RecoveryDecision::Retry { .. })))
        .count() as u32
}

fn replans_in_run(run: &[&Step]) -> u32 {
    run[1..]
        .iter()
        .filter(|s| matches!(s.recovery, Some(RecoveryDecision::Replan { .. })))
        .count() as u32
}

fn same_action(a: Option<&Action>, b: Option<&Action>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_intent(b),
        (None, None) => true,
        _ => false,
    }
}

fn describe(action: Option<&Action>) -> String {
    action
        .map(|a| a.describe())
        .unwrap_or_else(|| "turn".to_string())
}

fn abort_reason(run: &[&Step], replans: u32) -> String {
    let lines: Vec<String> = run
        .iter()
        .take(MAX_REASON_FAILURES)
        .map(|s| {
            format!(
                "step {}: {} ({})",
                if s.seq == 0 { "current".to_string() } else { s.seq.to_string() },
                describe(s.action.as_ref()),
                s.failure_detail().unwrap_or("unknown error")
            )
        })
        .collect();
    format!(
        "Gave up after {} failed attempt(s) and {} replan(s). Most recent failures: {}",
        run.len(),
        replans,
        lines.join("; ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FailureKind;
    use crate::perception::ElementId;
    use crate::session::{ExecutionResult, Step};

    fn failed_step(seq: u64, target: &str) -> Step {
        let mut step = Step::empty();
        step.seq = seq;
        step.action = Some(Action::click(ElementId::new(target)));
        step.execution = Some(ExecutionResult::failed(
            FailureKind::Execution,
            format!("{target} did not respond"),
            5,
        ));
        step
    }

    fn ok_step(seq: u64, target: &str) -> Step {
        let mut step = failed_step(seq, target);
        step.execution = Some(ExecutionResult::succeeded(5));
        step
    }

    fn run_always_failing(policy: RecoveryPolicy, targets: &[&str]) -> Vec<RecoveryDecision> {
        let strategy = RecoveryStrategy::new(policy);
        let mut history: Vec<Step> = Vec::new();
        let mut decisions = Vec::new();
        let mut idx = 0;
        loop {
            let mut step = failed_step(history.len() as u64 + 1, targets[idx]);
            let decision = strategy.decide(&step, &history);
            step.recovery = Some(decision.clone());
            history.push(step);
            decisions.push(decision.clone());
            match decision {
                RecoveryDecision::Retry { .. } => {}
                RecoveryDecision::Replan { .. } => idx += 1,
                RecoveryDecision::Abort { .. } => break,
            }
        }
        decisions
    }

    #[test]
    fn test_bounds_retry2_replan3_blocks_on_sixth() {
        let decisions = run_always_failing(RecoveryPolicy::default(), &["a", "b", "c", "d"]);
        assert_eq!(decisions.len(), 6);
        assert!(matches!(decisions[0], RecoveryDecision::Retry { attempt: 2 }));
        assert!(matches!(decisions[1], RecoveryDecision::Replan { .. }));
        assert!(matches!(decisions[2], RecoveryDecision::Retry { .. }));
        assert!(matches!(decisions[5], RecoveryDecision::Abort { .. }));
    }

    #[test]
    fn test_bounds_follow_configuration() {
        let policy = RecoveryPolicy {
            retry_bound: 3,
            replan_bound: 2,
        };
        let decisions = run_always_failing(policy, &["a", "b", "c"]);
        assert_eq!(decisions.len() as u32, policy.max_failed_steps());
    }

    #[test]
    fn test_success_resets_failure_run() {
        let strategy = RecoveryStrategy::default();
        let history = vec![
            failed_step(1, "a"),
            failed_step(2, "a"),
            ok_step(3, "b"),
        ];
        let decision = strategy.decide(&failed_step(4, "c"), &history);
        assert!(matches!(decision, RecoveryDecision::Retry { attempt: 2 }));
    }

    #[test]
    fn test_steps_without_execution_do_not_break_run() {
        let strategy = RecoveryStrategy::default();
        let mut first = failed_step(1, "a");
        first.recovery = Some(RecoveryDecision::Retry { attempt: 2 });
        let mut answered = Step::empty();
        answered.seq = 2;
        let history = vec![first, answered];
        let decision = strategy.decide(&failed_step(3, "a"), &history);
        assert!(matches!(decision, RecoveryDecision::Replan { .. }));
    }

    #[test]
    fn test_abort_reason_mentions_failures() {
        let decisions = run_always_failing(RecoveryPolicy::default(), &["a", "b", "c"]);
        match decisions.last() {
            Some(RecoveryDecision::Abort { reason }) => {
                assert!(reason.contains("6 failed attempt"));
                assert!(reason.contains("did not respond"));
            }
            other => panic!("Expected Abort, got {:?}", other),
        }
    }

    #[test]
    fn test_new_utterance_starts_fresh_run() {
        let strategy = RecoveryStrategy::default();
        let history: Vec<Step> = (1..=6).map(|i| failed_step(i, "a")).collect();
        let mut fresh = failed_step(7, "a");
        fresh.utterance = Some("try the other account".into());
        let decision = strategy.decide(&fresh, &history);
        assert!(matches!(decision, RecoveryDecision::Retry { attempt: 2 }));

        let mut history = history;
        fresh.recovery = Some(decision);
        history.push(fresh);
        let decision = strategy.decide(&failed_step(8, "a"), &history);
        assert!(matches!(decision, RecoveryDecision::Replan { .. }));
        let a = Action::click(ElementId::new("a"));
        assert_eq!(prior_attempts(Some(&a), &history), 1);
    }

    #[test]
    fn test_prior_attempts_counts_trailing_same_action() {
        let history = vec![ok_step(1, "a"), failed_step(2, "b"), failed_step(3, "b")];
        let b = Action::click(ElementId::new("b"));
        assert_eq!(prior_attempts(Some(&b), &history), 2);
        let a = Action::click(ElementId::new("a"));
        assert_eq!(prior_attempts(Some(&a), &history), 0);
    }

    #[test]
    fn test_failures_without_action_still_block() {
        let strategy = RecoveryStrategy::default();
        let mut history: Vec<Step> = Vec::new();
        let mut last = None;
        for seq in 1..=10u64 {
            let mut step = Step::empty();
            step.seq = seq;
            step.execution = Some(ExecutionResult::failed(
                FailureKind::Perception,
                "browser tab crashed",
                1,
            ));
            let decision = strategy.decide(&step, &history);
            step.recovery = Some(decision.clone());
            history.push(step);
            if matches!(decision, RecoveryDecision::Abort { .. }) {
                last = Some(seq);
                break;
            }
        }
        assert_eq!(last, Some(6));
    }

    #[test]
    fn test_same_action_on_changing_page_still_blocks() {
        let decisions = run_always_failing(RecoveryPolicy::default(), &["a", "a", "a", "a"]);
        assert_eq!(decisions.len(), 6);
        assert!(matches!(decisions[5], RecoveryDecision::Abort { .. }));
    }
}
