//! WorldView：一回合的页面结构化快照
//!
//! 每回合重新构建，不跨回合缓存。fingerprint 由 URL 与元素 (id, role, label) 计算，
//! 视觉描述不参与，用于判断页面是否变化以及动作是否来自当前快照。

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 稳定元素 ID（如 `button-ea3cc64786897431`），执行器用它定位元素
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 元素角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementRole {
    Button,
    Link,
    Textbox,
    Checkbox,
    Radio,
    Combobox,
    Option,
    Tab,
    MenuItem,
    Other,
}

impl ElementRole {
    /// 显式 role 优先，否则按标签 / input type 推断
    pub fn infer(tag: &str, explicit: Option<&str>, input_type: Option<&str>) -> Self {
        if let Some(role) = explicit {
            return match role.trim().to_lowercase().as_str() {
                "button" => ElementRole::Button,
                "link" => ElementRole::Link,
                "textbox" | "searchbox" | "spinbutton" => ElementRole::Textbox,
                "checkbox" | "switch" => ElementRole::Checkbox,
                "radio" => ElementRole::Radio,
                "combobox" | "listbox" => ElementRole::Combobox,
                "option" => ElementRole::Option,
                "tab" => ElementRole::Tab,
                "menuitem" | "menuitemcheckbox" | "menuitemradio" => ElementRole::MenuItem,
                _ => ElementRole::Other,
            };
        }
        match tag {
            "button" => ElementRole::Button,
            "a" => ElementRole::Link,
            "textarea" => ElementRole::Textbox,
            "select" => ElementRole::Combobox,
            "option" => ElementRole::Option,
            "input" => match input_type.unwrap_or("text").to_lowercase().as_str() {
                "button" | "submit" | "reset" | "image" => ElementRole::Button,
                "checkbox" => ElementRole::Checkbox,
                "radio" => ElementRole::Radio,
                _ => ElementRole::Textbox,
            },
            _ => ElementRole::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ElementRole::Button => "button",
            ElementRole::Link => "link",
            ElementRole::Textbox => "textbox",
            ElementRole::Checkbox => "checkbox",
            ElementRole::Radio => "radio",
            ElementRole::Combobox => "combobox",
            ElementRole::Option => "option",
            ElementRole::Tab => "tab",
            ElementRole::MenuItem => "menuitem",
            ElementRole::Other => "element",
        }
    }

    pub fn accepts_text(self) -> bool {
        matches!(self, ElementRole::Textbox | ElementRole::Combobox)
    }
}

impl fmt::Display for ElementRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// 位置描述：文档顺序 + 可选包围盒
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// 在原始元素列表中的下标
    pub order: usize,
    pub bounds: Option<BoundingBox>,
}

/// 可交互元素
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub role: ElementRole,
    pub label: String,
    pub position: Position,
    /// 执行器定位提示（CSS 选择器风格）
    pub locator: String,
}

/// 当前回合的页面快照
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorldView {
    pub url: String,
    pub title: String,
    pub elements: Vec<Element>,
    pub visual_summary: Option<String>,
    fingerprint: u64,
}

impl WorldView {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        elements: Vec<Element>,
        visual_summary: Option<String>,
    ) -> Self {
        let url = url.into();
        let fingerprint = compute_fingerprint(&url, &elements);
        Self {
            url,
            title: title.into(),
            elements,
            visual_summary,
            fingerprint,
        }
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.elements.iter().find(|e| &e.id == id)
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.get(id).is_some()
    }

    /// 按标签查找（不区分大小写），测试与规则提案使用
    pub fn find_by_label(&self, label: &str) -> Option<&Element> {
        let needle = label.to_lowercase();
        self.elements
            .iter()
            .find(|e| e.label.to_lowercase() == needle)
    }

    /// 渲染为提案 prompt 中的页面段落
    pub fn to_prompt_section(&self) -> String {
        let mut out = format!("URL: {}\nTitle: {}\n", self.url, self.title);
        if self.elements.is_empty() {
            out.push_str("Interactive elements: (none)\n");
        } else {
            out.push_str("Interactive elements:\n");
            for e in &self.elements {
                out.push_str(&format!("- [{}] {} \"{}\"\n", e.id, e.role, e.label));
            }
        }
        if let Some(summary) = &self.visual_summary {
            out.push_str(&format!("Visual summary: {}\n", summary));
        }
        out
    }
}

fn compute_fingerprint(url: &str, elements: &[Element]) -> u64 {
    let mut parts = Vec::with_capacity(1 + elements.len() * 3);
    parts.push(url);
    for e in elements {
        parts.push(e.id.as_str());
        parts.push(e.role.as_str());
        parts.push(e.label.as_str());
    }
    stable_hash(&parts)
}

/// SHA-256 前 8 字节（大端）。各段以 0x1f 分隔，避免拼接歧义；结果不随进程或 Rust 版本变化
pub(crate) fn stable_hash(parts: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1fu8]);
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(id: &str, label: &str, order: usize) -> Element {
        Element {
            id: ElementId::new(id),
            role: ElementRole::Button,
            label: label.to_string(),
            position: Position { order, bounds: None },
            locator: format!("button:has-text(\"{label}\")"),
        }
    }

    #[test]
    fn test_fingerprint_ignores_visual_summary() {
        let a = WorldView::new("http://x", "X", vec![element("button-1", "Go", 0)], None);
        let b = WorldView::new(
            "http://x",
            "X",
            vec![element("button-1", "Go", 0)],
            Some("a blue button".into()),
        );
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_elements() {
        let a = WorldView::new("http://x", "X", vec![element("button-1", "Go", 0)], None);
        let b = WorldView::new("http://x", "X", vec![element("button-2", "Stop", 0)], None);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert!(a.contains(&ElementId::new("button-1")));
        assert!(!b.contains(&ElementId::new("button-1")));
    }

    #[test]
    fn test_role_inference() {
        assert_eq!(ElementRole::infer("input", None, Some("submit")), ElementRole::Button);
        assert_eq!(ElementRole::infer("input", None, None), ElementRole::Textbox);
        assert_eq!(ElementRole::infer("div", Some("button"), None), ElementRole::Button);
        assert_eq!(ElementRole::infer("a", None, None), ElementRole::Link);
    }

    #[test]
    fn test_prompt_section_lists_ids() {
        let wv = WorldView::new("http://x", "X", vec![element("button-1", "Go", 0)], None);
        let text = wv.to_prompt_section();
        assert!(text.contains("[button-1] button \"Go\""));
    }
}
