//! Action：一次提议的页面交互
//!
//! Action 记录产生它的 WorldView 指纹（observed），只对那份 WorldView 有效。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::perception::{ElementId, WorldView};

/// 动作类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Navigate,
    Wait,
    AskUser,
    Finish,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::Click,
        ActionKind::Type,
        ActionKind::Navigate,
        ActionKind::Wait,
        ActionKind::AskUser,
        ActionKind::Finish,
    ];

    /// 需要在 WorldView 中解析目标元素
    pub fn requires_target(self) -> bool {
        matches!(self, ActionKind::Click | ActionKind::Type)
    }

    /// 必须携带 payload（输入文本 / URL / 问题）
    pub fn requires_payload(self) -> bool {
        matches!(self, ActionKind::Type | ActionKind::Navigate | ActionKind::AskUser)
    }

    /// 交给执行器执行（finish / ask_user 不执行）
    pub fn is_executable(self) -> bool {
        !matches!(self, ActionKind::AskUser | ActionKind::Finish)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Navigate => "navigate",
            ActionKind::Wait => "wait",
            ActionKind::AskUser => "ask_user",
            ActionKind::Finish => "finish",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    /// 大小写与分隔符不敏感；接受常见别名（fill / input / goto / done ...）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_lowercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "click" | "press" | "tap" => Ok(ActionKind::Click),
            "type" | "type_text" | "fill" | "input" | "enter_text" => Ok(ActionKind::Type),
            "navigate" | "goto" | "go_to" | "open" | "visit" => Ok(ActionKind::Navigate),
            "wait" | "sleep" => Ok(ActionKind::Wait),
            "ask_user" | "ask" | "clarify" => Ok(ActionKind::AskUser),
            "finish" | "done" | "complete" => Ok(ActionKind::Finish),
            other => Err(format!("unknown action type: {other}")),
        }
    }
}

/// 提议的动作
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub target: Option<ElementId>,
    /// 输入文本 / URL / 问题 / 完成摘要 / 等待毫秒数
    pub payload: Option<String>,
    pub explanation: Option<String>,
    /// 产生该动作的 WorldView 指纹
    pub observed: u64,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            target: None,
            payload: None,
            explanation: None,
            observed: 0,
        }
    }

    pub fn click(target: ElementId) -> Self {
        Self {
            target: Some(target),
            ..Self::new(ActionKind::Click)
        }
    }

    pub fn type_text(target: ElementId, text: impl Into<String>) -> Self {
        Self {
            target: Some(target),
            payload: Some(text.into()),
            ..Self::new(ActionKind::Type)
        }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self {
            payload: Some(url.into()),
            ..Self::new(ActionKind::Navigate)
        }
    }

    pub fn wait(millis: u64) -> Self {
        Self {
            payload: Some(millis.to_string()),
            ..Self::new(ActionKind::Wait)
        }
    }

    pub fn ask_user(question: impl Into<String>) -> Self {
        Self {
            payload: Some(question.into()),
            ..Self::new(ActionKind::AskUser)
        }
    }

    pub fn finish(summary: impl Into<String>) -> Self {
        Self {
            payload: Some(summary.into()),
            ..Self::new(ActionKind::Finish)
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    /// 绑定到某份 WorldView
    pub fn observed_on(mut self, world_view: &WorldView) -> Self {
        self.observed = world_view.fingerprint();
        self
    }

    /// 同一意图：类型、目标、payload 都相同（忽略说明与指纹）
    pub fn same_intent(&self, other: &Action) -> bool {
        self.kind == other.kind && self.target == other.target && self.payload == other.payload
    }

    /// 日志 / 提示用的简短描述；输入文本不回显
    pub fn describe(&self) -> String {
        match (self.kind, &self.target) {
            (ActionKind::Type, Some(t)) => format!(
                "type into {} ({} chars)",
                t,
                self.payload.as_deref().map(|p| p.chars().count()).unwrap_or(0)
            ),
            (kind, Some(t)) => format!("{} {}", kind, t),
            (ActionKind::Navigate, None) => {
                format!("navigate to {}", self.payload.as_deref().unwrap_or("?"))
            }
            (kind, None) => kind.to_string(),
        }
    }

    /// 等待时长（毫秒），缺省 1000
    pub fn wait_millis(&self) -> u64 {
        self.payload
            .as_deref()
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(1000)
    }
}
