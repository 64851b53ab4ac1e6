//! 会话层：Step 历史、会话状态、页面资源与会话管理器

pub mod manager;
pub mod resources;
#[allow(clippy::module_inception)]
pub mod session;
pub mod step;

pub use manager::{SessionManager, SessionSnapshot, TurnRequest, TurnResponse};
pub use resources::{PageHandles, PageProvider};
pub use session::{Session, SessionId};
pub use step::{ExecutionResult, Step, StepLog, TurnOutcome, ValidationOutcome};
