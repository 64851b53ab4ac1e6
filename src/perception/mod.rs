//! 感知层：页面原始元素 → WorldView
//!
//! - **PageSource**：外部页面读取（浏览器 / 模拟站点），产出 RawPage
//! - **VisionDescriber**：可选的视觉描述
//! - **WorldViewBuilder**：分配稳定 ID，拼出当前回合的 WorldView

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod builder;
#[cfg(feature = "browser")]
pub mod browser;
pub mod world_view;

pub use builder::{assign_ids, locate, WorldViewBuilder};
pub use world_view::{BoundingBox, Element, ElementId, ElementRole, Position, WorldView};

/// DOM 提取出的原始元素（文档顺序）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawElement {
    /// 小写标签名
    pub tag: String,
    /// 显式 role 属性
    pub role: Option<String>,
    /// 可见文本
    pub text: String,
    pub attributes: HashMap<String, String>,
    pub bounds: Option<BoundingBox>,
}

impl RawElement {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into().to_lowercase(),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}

/// 一次页面读取的结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPage {
    pub url: String,
    pub title: String,
    pub elements: Vec<RawElement>,
    /// PNG 截图（视觉描述用，可缺省）
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
}

/// 页面读取（外部协作方）
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn read_page(&self) -> Result<RawPage, String>;
}

/// 视觉描述（外部协作方，可选）
#[async_trait]
pub trait VisionDescriber: Send + Sync {
    async fn describe(&self, page: &RawPage) -> Result<String, String>;
}
