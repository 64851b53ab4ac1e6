//! Webpilot - 逐回合的网页自主操作智能体
//!
//! 模块划分：
//! - **agent**: 从配置装配决策引擎与会话管理器
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、决策状态机、恢复策略、会话监管
//! - **decision**: 动作模型、意图识别、提案、校验与回合引擎
//! - **execution**: 执行器接口与审计
//! - **knowledge**: 检索接口、知识融合、内存混合检索与问答
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **perception**: 页面读取与 WorldView 构建
//! - **session**: Step 历史与会话管理器（对外的逐回合协议）
//! - **sim**: 内存模拟登录站点

pub mod agent;
pub mod config;
pub mod core;
pub mod decision;
pub mod execution;
pub mod knowledge;
pub mod llm;
pub mod observability;
pub mod perception;
pub mod session;
pub mod sim;

pub use agent::{create_agent_components, create_session_manager, AgentComponents};
pub use session::{SessionManager, TurnRequest, TurnResponse};
