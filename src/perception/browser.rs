//! Headless Chrome 页面提供方
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! 每个会话一个 Tab；读取页面与执行动作都在 spawn_blocking 中通过 JS 完成，
//! 两边枚举元素的选择器与顺序一致，稳定 ID 经 `locate` 解析回文档顺序下标。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, Tab};

use crate::decision::{Action, ActionKind};
use crate::execution::{ActionExecutor, ExecutionReport};
use crate::perception::{locate, PageSource, RawElement, RawPage};
use crate::session::{PageHandles, PageProvider};

const INTERACTIVE_SELECTOR: &str =
    "button, a[href], input, select, textarea, [role=button], [role=link], [role=tab], [role=menuitem], [role=checkbox], [role=radio], [role=option], [role=textbox], [role=combobox], [contenteditable=true]";

/// 页面加载后的稳定等待
const SETTLE: Duration = Duration::from_millis(500);

fn read_script() -> String {
    format!(
        r#"
        (function() {{
            const out = [];
            for (const el of document.querySelectorAll('{sel}')) {{
                const attrs = {{}};
                for (const a of el.attributes) attrs[a.name] = a.value;
                const r = el.getBoundingClientRect();
                const visible = r.width > 0 && r.height > 0 && getComputedStyle(el).visibility !== 'hidden';
                if (!visible) attrs['hidden'] = '';
                out.push({{
                    tag: el.tagName.toLowerCase(),
                    role: el.getAttribute('role'),
                    text: (el.innerText || el.value || '').trim().substring(0, 120),
                    attributes: attrs,
                    bounds: {{ x: r.x, y: r.y, width: r.width, height: r.height }}
                }});
            }}
            return JSON.stringify({{ url: location.href, title: document.title, elements: out }});
        }})()
        "#,
        sel = INTERACTIVE_SELECTOR
    )
}

fn act_script(index: usize, kind: ActionKind, text: Option<&str>) -> String {
    let escaped = text
        .unwrap_or_default()
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");
    let body = match kind {
        ActionKind::Type => format!(
            r#"el.focus();
               if (el.tagName === 'INPUT' || el.tagName === 'TEXTAREA') {{ el.value = "{escaped}"; }}
               else {{ el.textContent = "{escaped}"; }}
               el.dispatchEvent(new Event('input', {{ bubbles: true }}));
               el.dispatchEvent(new Event('change', {{ bubbles: true }}));"#
        ),
        _ => "el.click();".to_string(),
    };
    format!(
        r#"
        (function() {{
            const el = document.querySelectorAll('{sel}')[{index}];
            if (!el) return 'missing';
            el.scrollIntoView({{ behavior: 'instant', block: 'center' }});
            {body}
            return 'ok';
        }})()
        "#,
        sel = INTERACTIVE_SELECTOR
    )
}

/// 截图失败不影响页面读取
fn screenshot(tab: &Tab) -> Option<Vec<u8>> {
    match tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true) {
        Ok(png) => Some(png),
        Err(e) => {
            tracing::warn!(error = %e, "screenshot failed, vision will be skipped");
            None
        }
    }
}

fn snapshot(tab: &Tab) -> Result<RawPage, String> {
    let result = tab
        .evaluate(&read_script(), false)
        .map_err(|e| format!("Read page failed: {}", e))?;
    let json = result
        .value
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| "Read page returned nothing".to_string())?;

    #[derive(serde::Deserialize)]
    struct Snapshot {
        url: String,
        title: String,
        elements: Vec<RawElement>,
    }
    let snap: Snapshot = serde_json::from_str(&json).map_err(|e| format!("Bad page snapshot: {}", e))?;
    Ok(RawPage {
        url: snap.url,
        title: snap.title,
        elements: snap.elements,
        screenshot: None,
    })
}

/// 单个会话的 Tab
pub struct ChromePage {
    tab: Arc<Tab>,
    max_elements: usize,
    screenshots: bool,
}

#[async_trait]
impl PageSource for ChromePage {
    async fn read_page(&self) -> Result<RawPage, String> {
        let tab = Arc::clone(&self.tab);
        let screenshots = self.screenshots;
        tokio::task::spawn_blocking(move || -> Result<RawPage, String> {
            let mut page = snapshot(&tab)?;
            if screenshots {
                page.screenshot = screenshot(&tab);
            }
            Ok(page)
        })
        .await
        .map_err(|e| format!("Task join: {}", e))?
    }
}

#[async_trait]
impl ActionExecutor for ChromePage {
    async fn execute(&self, action: &Action) -> ExecutionReport {
        let tab = Arc::clone(&self.tab);
        let action = action.clone();
        let max_elements = self.max_elements;

        let outcome = tokio::task::spawn_blocking(move || -> Result<(), String> {
            match action.kind {
                ActionKind::Navigate => {
                    let url = action.payload.as_deref().unwrap_or_default();
                    tab.navigate_to(url).map_err(|e| format!("Navigate failed: {}", e))?;
                    tab.wait_until_navigated()
                        .map_err(|e| format!("Page load failed: {}", e))?;
                }
                ActionKind::Wait => std::thread::sleep(Duration::from_millis(action.wait_millis())),
                ActionKind::Click | ActionKind::Type => {
                    let target = action
                        .target
                        .as_ref()
                        .ok_or_else(|| format!("{} needs a target", action.kind))?;
                    let page = snapshot(&tab)?;
                    let index = locate(&page, target, max_elements)
                        .ok_or_else(|| format!("Element {} not found on page", target))?;
                    let result = tab
                        .evaluate(&act_script(index, action.kind, action.payload.as_deref()), false)
                        .map_err(|e| format!("{} failed: {}", action.kind, e))?;
                    if result.value.and_then(|v| v.as_str().map(str::to_string)).as_deref() != Some("ok") {
                        return Err(format!("Element {} disappeared before {}", target, action.kind));
                    }
                }
                ActionKind::AskUser | ActionKind::Finish => {}
            }
            std::thread::sleep(SETTLE);
            Ok(())
        })
        .await;

        match outcome {
            Ok(Ok(())) => ExecutionReport::ok(),
            Ok(Err(e)) => ExecutionReport::failed(e),
            Err(e) => ExecutionReport::failed(format!("Task join: {}", e)),
        }
    }
}

/// 共享一个 Chrome 进程，为每个会话开一个 Tab
pub struct ChromeProvider {
    browser: Arc<Mutex<Option<Browser>>>,
    tabs: Mutex<HashMap<String, Arc<Tab>>>,
    max_elements: usize,
    screenshots: bool,
}

impl ChromeProvider {
    pub fn new(max_elements: usize) -> Self {
        Self {
            browser: Arc::new(Mutex::new(None)),
            tabs: Mutex::new(HashMap::new()),
            max_elements,
            screenshots: false,
        }
    }

    /// 每次读取页面时附带截图（视觉描述打开时使用）
    pub fn with_screenshots(mut self, enabled: bool) -> Self {
        self.screenshots = enabled;
        self
    }
}

#[async_trait]
impl PageProvider for ChromeProvider {
    async fn acquire(&self, session_id: &str, start_url: &str) -> Result<PageHandles, String> {
        let browser_arc = Arc::clone(&self.browser);
        let url = start_url.to_string();
        tracing::info!(session_id, url = %url, "opening browser tab");

        let tab = tokio::task::spawn_blocking(move || -> Result<Arc<Tab>, String> {
            let mut guard = browser_arc.lock().map_err(|e| e.to_string())?;
            if guard.is_none() {
                *guard = Some(Browser::default().map_err(|e| format!("Chrome launch failed: {}", e))?);
            }
            let browser = guard.as_ref().ok_or_else(|| "Chrome not available".to_string())?;
            let tab = browser.new_tab().map_err(|e| format!("Browser tab failed: {}", e))?;
            tab.navigate_to(&url).map_err(|e| format!("Navigate failed: {}", e))?;
            tab.wait_for_element("body")
                .map_err(|e| format!("Page load failed: {}", e))?;
            std::thread::sleep(SETTLE);
            Ok(tab)
        })
        .await
        .map_err(|e| format!("Task join: {}", e))??;

        self.tabs
            .lock()
            .map_err(|e| e.to_string())?
            .insert(session_id.to_string(), Arc::clone(&tab));

        let page = Arc::new(ChromePage {
            tab,
            max_elements: self.max_elements,
            screenshots: self.screenshots,
        });
        Ok(PageHandles::new(page.clone(), page))
    }

    async fn release(&self, session_id: &str) {
        let tab = match self.tabs.lock() {
            Ok(mut tabs) => tabs.remove(session_id),
            Err(_) => None,
        };
        if let Some(tab) = tab {
            let _ = tokio::task::spawn_blocking(move || tab.close(true)).await;
            tracing::info!(session_id, "browser tab closed");
        }
    }
}
