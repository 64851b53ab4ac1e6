//! WorldView 构建：稳定 ID 分配 + 可选视觉描述
//!
//! ID 由 (role, 归一化 label, 定位提示, 同键出现序号) 的 SHA-256 前 64 位得到（16 位十六进制），
//! 页面不变时连续两次构建得到相同 ID；元素消失则 ID 随之消失，校验器据此发现过期动作。

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::AgentError;
use crate::perception::world_view::stable_hash;
use crate::perception::{
    Element, ElementId, ElementRole, PageSource, Position, RawElement, RawPage, VisionDescriber,
    WorldView,
};

/// label 最长保留字符数
const MAX_LABEL_CHARS: usize = 80;

/// WorldView 构建器
pub struct WorldViewBuilder {
    vision: Option<Arc<dyn VisionDescriber>>,
    max_elements: usize,
}

impl WorldViewBuilder {
    pub fn new(max_elements: usize) -> Self {
        Self {
            vision: None,
            max_elements: max_elements.max(1),
        }
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionDescriber>) -> Self {
        self.vision = Some(vision);
        self
    }

    /// 读取页面并构建 WorldView；读取失败时重读一次，仍失败则返回 PerceptionFailure
    pub async fn build(&self, source: &dyn PageSource) -> Result<WorldView, AgentError> {
        let page = match source.read_page().await {
            Ok(page) => page,
            Err(first) => {
                tracing::warn!(error = %first, "page read failed, rebuilding world view once");
                source.read_page().await.map_err(|second| {
                    AgentError::PerceptionFailure(format!("{second} (first attempt: {first})"))
                })?
            }
        };
        Ok(self.from_page(&page).await)
    }

    /// 从已读取的页面构建；视觉描述失败降级为纯 DOM
    pub async fn from_page(&self, page: &RawPage) -> WorldView {
        let elements = assign_ids(&page.elements, self.max_elements);
        let visual_summary = match &self.vision {
            Some(vision) => match vision.describe(page).await {
                Ok(summary) if !summary.trim().is_empty() => Some(summary.trim().to_string()),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "vision describe failed, using DOM only");
                    None
                }
            },
            None => None,
        };
        tracing::debug!(
            url = %page.url,
            raw = page.elements.len(),
            kept = elements.len(),
            vision = visual_summary.is_some(),
            "world view built"
        );
        WorldView::new(page.url.clone(), page.title.clone(), elements, visual_summary)
    }
}

/// 为原始元素分配稳定 ID；隐藏元素与无可见 label 的元素被丢弃
pub fn assign_ids(raw: &[RawElement], max_elements: usize) -> Vec<Element> {
    let mut occurrences: HashMap<(ElementRole, String, String), u32> = HashMap::new();
    let mut out = Vec::new();

    for (order, el) in raw.iter().enumerate() {
        if out.len() >= max_elements {
            break;
        }
        if is_hidden(el) {
            continue;
        }
        let label = element_label(el);
        if label.is_empty() {
            continue;
        }
        let role = ElementRole::infer(&el.tag, el.role.as_deref(), el.attr("type"));
        let locator = locator_hint(el, &label);

        let normalized = label.to_lowercase();
        let nth = occurrences
            .entry((role, normalized.clone(), locator.clone()))
            .or_insert(0);
        let occurrence = nth.to_string();
        let digest = stable_hash(&[
            role.as_str(),
            normalized.as_str(),
            locator.as_str(),
            occurrence.as_str(),
        ]);
        *nth += 1;

        out.push(Element {
            id: ElementId::new(format!("{}-{:016x}", role.as_str(), digest)),
            role,
            label,
            position: Position {
                order,
                bounds: el.bounds,
            },
            locator,
        });
    }
    out
}

/// 把稳定 ID 解析回原始元素下标（执行器使用）
pub fn locate(page: &RawPage, id: &ElementId, max_elements: usize) -> Option<usize> {
    assign_ids(&page.elements, max_elements)
        .into_iter()
        .find(|e| &e.id == id)
        .map(|e| e.position.order)
}

fn is_hidden(el: &RawElement) -> bool {
    if el.tag == "input" && el.attr("type").map(|t| t.eq_ignore_ascii_case("hidden")) == Some(true) {
        return true;
    }
    el.attributes.contains_key("hidden") || el.attr("aria-hidden") == Some("true")
}

/// aria-label → 文本 → placeholder → title → name
fn element_label(el: &RawElement) -> String {
    let candidate = el
        .attr("aria-label")
        .map(str::to_string)
        .or_else(|| Some(el.text.clone()).filter(|t| !t.trim().is_empty()))
        .or_else(|| el.attr("placeholder").map(str::to_string))
        .or_else(|| el.attr("title").map(str::to_string))
        .or_else(|| el.attr("name").map(str::to_string))
        .unwrap_or_default();
    normalize(&candidate)
}

fn normalize(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_LABEL_CHARS).collect()
}

/// 定位提示优先级：id → data-testid → aria-label → name → 文本
fn locator_hint(el: &RawElement, label: &str) -> String {
    let tag = &el.tag;
    if let Some(id) = el.attr("id") {
        return format!("#{id}");
    }
    if let Some(testid) = el.attr("data-testid") {
        return format!("{tag}[data-testid='{}']", escape(testid));
    }
    if let Some(aria) = el.attr("aria-label") {
        return format!("{tag}[aria-label='{}']", escape(aria));
    }
    if let Some(name) = el.attr("name") {
        return format!("{tag}[name='{}']", escape(name));
    }
    format!("{tag}:has-text('{}')", escape(label))
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
