//! 决策层：动作模型、意图识别、提案、校验、稳定性排序与回合状态机

pub mod action;
pub mod context;
pub mod engine;
pub mod events;
pub mod intent;
pub mod planner;
pub mod stability;
pub mod validator;

pub use action::{Action, ActionKind};
pub use context::{DecisionContext, StepDigest};
pub use engine::{AnswerInput, DecisionEngine, PendingDirective, TurnInput, TurnOutput};
pub use events::DecisionEvent;
pub use intent::{Intent, IntentClassifier};
pub use planner::{
    parse_proposal, ActionProposer, Candidate, LlmProposer, Proposal, RuleBasedProposer, Verdict,
    DEFAULT_PROPOSER_PROMPT,
};
pub use stability::{rank_candidates, stability_streak};
pub use validator::{ContextSignals, ModePolicy, Validator};
