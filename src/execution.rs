//! 动作执行：外部执行器接口 + 计时与审计
//!
//! 每次执行输出一行结构化审计日志（JSON）；输入文本只记录长度。

use std::time::Instant;

use async_trait::async_trait;

use crate::core::FailureKind;
use crate::decision::Action;
use crate::session::ExecutionResult;

/// 执行器报告
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub success: bool,
    pub error_detail: Option<String>,
}

impl ExecutionReport {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            error_detail: Some(detail.into()),
        }
    }
}

/// 执行器（外部协作方）：用 WorldView 分配的稳定 ID 定位元素
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action) -> ExecutionReport;
}

/// 执行并计时，输出审计日志
pub async fn execute_audited(
    executor: &dyn ActionExecutor,
    action: &Action,
    session_id: &str,
) -> ExecutionResult {
    let start = Instant::now();
    let report = executor.execute(action).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let audit = serde_json::json!({
        "event": "action_audit",
        "session_id": session_id,
        "kind": action.kind.as_str(),
        "target": action.target.as_ref().map(|t| t.as_str()),
        "payload_chars": action.payload.as_deref().map(|p| p.chars().count()),
        "ok": report.success,
        "duration_ms": duration_ms,
        "error": report.error_detail,
    });
    tracing::info!(audit = %audit.to_string(), "action");

    if report.success {
        ExecutionResult::succeeded(duration_ms)
    } else {
        ExecutionResult::failed(
            FailureKind::Execution,
            report
                .error_detail
                .unwrap_or_else(|| "executor reported failure".to_string()),
            duration_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::ElementId;

    struct Refuses;

    #[async_trait]
    impl ActionExecutor for Refuses {
        async fn execute(&self, _action: &Action) -> ExecutionReport {
            ExecutionReport {
                success: false,
                error_detail: None,
            }
        }
    }

    #[tokio::test]
    async fn test_failure_gets_default_detail() {
        let result = execute_audited(&Refuses, &Action::click(ElementId::new("button-1")), "s1").await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Execution));
        assert_eq!(result.error_detail.as_deref(), Some("executor reported failure"));
    }
}
