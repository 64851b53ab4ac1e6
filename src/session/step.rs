//! Step：一回合的完整记录；StepLog：只追加的历史
//!
//! Step 追加后不可变，StepLog 不提供任何可变访问，序号严格递增。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{DecisionState, FailureKind, RecoveryDecision, Rejection};
use crate::decision::{Action, Intent};
use crate::knowledge::KnowledgeStatus;
use crate::perception::WorldView;

/// 执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub failure: Option<FailureKind>,
    pub error_detail: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(duration_ms: u64) -> Self {
        Self {
            success: true,
            failure: None,
            error_detail: None,
            duration_ms,
        }
    }

    pub fn failed(kind: FailureKind, detail: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            failure: Some(kind),
            error_detail: Some(detail.into()),
            duration_ms,
        }
    }
}

/// 校验结果：被拒绝的候选（按顺序）以及最终是否有动作通过
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub accepted: bool,
    pub rejections: Vec<Rejection>,
}

/// 回合结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Succeeded,
    Failed,
    Done,
    Blocked,
    AwaitingInput,
    /// 问答回合，不经过校验与执行
    Answered,
    /// 提案方不可用等基础设施故障
    Faulted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub world_view: Option<Arc<WorldView>>,
    pub utterance: Option<String>,
    pub intent: Option<Intent>,
    pub action: Option<Action>,
    pub rationale: Option<String>,
    pub validation: ValidationOutcome,
    pub execution: Option<ExecutionResult>,
    /// 本动作此前连续失败的次数
    pub retry_count: u32,
    pub knowledge: KnowledgeStatus,
    pub recovery: Option<RecoveryDecision>,
    pub trace: Vec<DecisionState>,
    pub outcome: TurnOutcome,
    pub answer: Option<String>,
    pub message: String,
}

impl Step {
    /// 空白 Step（seq 在追加时分配）
    pub fn empty() -> Self {
        Self {
            seq: 0,
            at: Utc::now(),
            world_view: None,
            utterance: None,
            intent: None,
            action: None,
            rationale: None,
            validation: ValidationOutcome::default(),
            execution: None,
            retry_count: 0,
            knowledge: KnowledgeStatus::Disabled,
            recovery: None,
            trace: Vec::new(),
            outcome: TurnOutcome::Answered,
            answer: None,
            message: String::new(),
        }
    }

    pub fn failure_detail(&self) -> Option<&str> {
        self.execution
            .as_ref()
            .filter(|e| !e.success)
            .and_then(|e| e.error_detail.as_deref())
    }

    pub fn failed(&self) -> bool {
        self.execution.as_ref().is_some_and(|e| !e.success)
    }
}

/// 只追加的 Step 历史
#[derive(Debug, Clone, Default)]
pub struct StepLog {
    steps: Vec<Step>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加并分配序号，返回该序号
    pub fn append(&mut self, mut step: Step) -> u64 {
        let seq = self.steps.last().map(|s| s.seq).unwrap_or(0) + 1;
        step.seq = seq;
        self.steps.push(step);
        seq
    }

    pub fn as_slice(&self) -> &[Step] {
        &self.steps
    }

    pub fn last(&self) -> Option<&Step> {
        self.steps.last()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 最近一个带 WorldView 的 Step 的快照
    pub fn last_world_view(&self) -> Option<&Arc<WorldView>> {
        self.steps.iter().rev().find_map(|s| s.world_view.as_ref())
    }
}
