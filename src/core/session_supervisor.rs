//! 会话监管：取消令牌与资源释放
//!
//! 每个会话持有一个根 CancellationToken；每回合派生子 token，
//! close 时取消根 token，正在进行的回合会在下一个挂起点退出，且不会再执行任何动作。

use tokio_util::sync::CancellationToken;

/// 会话级生命周期：根取消令牌
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
        }
    }

    /// 为单个回合创建子 token
    pub fn turn_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 关闭会话：所有回合 token 一并取消
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
