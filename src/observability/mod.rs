//! 可观测性：tracing 订阅者初始化
//!
//! 默认级别 info，可用 RUST_LOG 覆盖（如 `RUST_LOG=webpilot=debug`）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化全局订阅者；重复调用时忽略（测试中多次初始化）
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
