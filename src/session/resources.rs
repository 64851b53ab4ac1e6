//! 会话资源：每个会话独占的页面读取器与执行器
//!
//! init 时向 PageProvider 申请，close 时归还；回合只借用，不持有所有权。

use std::sync::Arc;

use async_trait::async_trait;

use crate::execution::ActionExecutor;
use crate::perception::PageSource;

/// 一个会话的页面句柄
#[derive(Clone)]
pub struct PageHandles {
    pub source: Arc<dyn PageSource>,
    pub executor: Arc<dyn ActionExecutor>,
}

impl PageHandles {
    pub fn new(source: Arc<dyn PageSource>, executor: Arc<dyn ActionExecutor>) -> Self {
        Self { source, executor }
    }
}

impl std::fmt::Debug for PageHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandles").finish_non_exhaustive()
    }
}

/// 页面提供方（浏览器、模拟站点等）
#[async_trait]
pub trait PageProvider: Send + Sync {
    /// 为会话打开起始页
    async fn acquire(&self, session_id: &str, start_url: &str) -> Result<PageHandles, String>;

    /// 释放会话占用的页面；重复调用必须安全
    async fn release(&self, session_id: &str);
}
