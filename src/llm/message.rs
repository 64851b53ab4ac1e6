//! 发给 LLM 的消息，以及问答路径的有界对话记录

use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }
}

/// 最近 capacity 次问答；容量为 0 时什么都不记
#[derive(Clone, Debug)]
pub struct Transcript {
    exchanges: VecDeque<(String, String)>,
    capacity: usize,
}

impl Transcript {
    pub fn new(capacity: usize) -> Self {
        Self {
            exchanges: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.exchanges.len() == self.capacity {
            self.exchanges.pop_front();
        }
        self.exchanges.push_back((question.into(), answer.into()));
    }

    /// 按时间顺序展开为 user / assistant 消息对
    pub fn messages(&self) -> impl Iterator<Item = Message> + '_ {
        self.exchanges
            .iter()
            .flat_map(|(q, a)| [Message::user(q.as_str()), Message::assistant(a.as_str())])
    }

    /// 已记录的问答次数
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
