//! 核心层：错误分类、决策状态机、恢复策略、会话监管

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{AgentError, FailureKind, Rejection};
pub use recovery::{RecoveryDecision, RecoveryPolicy, RecoveryStrategy};
pub use session_supervisor::SessionSupervisor;
pub use state::{DecisionState, SessionMode, SessionStatus, StateTrace};
