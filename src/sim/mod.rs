//! 模拟站点：内存中的登录页，实现页面读取与执行器
//!
//! 用于演示入口与集成测试，不依赖浏览器。登录成功后进入带「Log out」的欢迎页。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::decision::{Action, ActionKind};
use crate::execution::{ActionExecutor, ExecutionReport};
use crate::perception::{assign_ids, locate, ElementId, PageSource, RawElement, RawPage};
use crate::session::{PageHandles, PageProvider};

const MAX_ELEMENTS: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Screen {
    Login,
    Dashboard,
}

#[derive(Debug)]
struct SiteState {
    url: String,
    screen: Screen,
    fields: HashMap<String, String>,
    error: Option<String>,
    remember_me: bool,
    executed: Vec<Action>,
    reads: usize,
}

/// 内存登录站点
pub struct LoginSite {
    username: String,
    password: String,
    state: Mutex<SiteState>,
    failure: Option<String>,
    latency: Duration,
}

impl LoginSite {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            state: Mutex::new(SiteState {
                url: "https://sim.webpilot.test/login".to_string(),
                screen: Screen::Login,
                fields: HashMap::new(),
                error: None,
                remember_me: false,
                executed: Vec::new(),
                reads: 0,
            }),
            failure: None,
            latency: Duration::ZERO,
        }
    }

    /// 所有动作都报告失败
    pub fn with_executor_failure(mut self, detail: impl Into<String>) -> Self {
        self.failure = Some(detail.into());
        self
    }

    /// 每次执行前等待
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, SiteState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn raw_page(&self) -> RawPage {
        render(&self.state(), &self.username)
    }

    /// 当前页面上给定 label 的元素 ID
    pub fn element_id(&self, label: &str) -> Option<ElementId> {
        assign_ids(&self.raw_page().elements, MAX_ELEMENTS)
            .into_iter()
            .find(|e| e.label.eq_ignore_ascii_case(label))
            .map(|e| e.id)
    }

    pub fn logged_in(&self) -> bool {
        self.state().screen == Screen::Dashboard
    }

    /// 执行器实际执行过的动作
    pub fn executed(&self) -> Vec<Action> {
        self.state().executed.clone()
    }

    pub fn reads(&self) -> usize {
        self.state().reads
    }

    /// 在登录表单上加一个「Remember me」复选框，使页面指纹变化
    pub fn add_remember_me(&self) {
        self.state().remember_me = true;
    }

    fn apply(&self, action: &Action) -> Result<(), String> {
        let mut state = self.state();
        state.executed.push(action.clone());

        if let Some(detail) = &self.failure {
            return Err(detail.clone());
        }

        match action.kind {
            ActionKind::Navigate => {
                let url = action.payload.clone().unwrap_or_default();
                state.screen = if url.contains("dashboard") && state.screen == Screen::Dashboard {
                    Screen::Dashboard
                } else {
                    Screen::Login
                };
                state.url = url;
                Ok(())
            }
            ActionKind::Wait | ActionKind::AskUser | ActionKind::Finish => Ok(()),
            ActionKind::Click | ActionKind::Type => {
                let target = action
                    .target
                    .as_ref()
                    .ok_or_else(|| format!("{} needs a target", action.kind))?;
                let page = render(&state, &self.username);
                let index = locate(&page, target, MAX_ELEMENTS)
                    .ok_or_else(|| format!("element {} not found", target))?;
                let element = &page.elements[index];
                let name = element.attr("name").unwrap_or_default().to_string();

                if action.kind == ActionKind::Type {
                    if element.tag != "input" {
                        return Err(format!("element {} does not accept text", target));
                    }
                    state
                        .fields
                        .insert(name, action.payload.clone().unwrap_or_default());
                    return Ok(());
                }

                match name.as_str() {
                    "submit" => {
                        let user = state.fields.get("username").cloned().unwrap_or_default();
                        let pass = state.fields.get("password").cloned().unwrap_or_default();
                        if user == self.username && pass == self.password {
                            state.screen = Screen::Dashboard;
                            state.url = "https://sim.webpilot.test/dashboard".to_string();
                            state.error = None;
                        } else {
                            state.error = Some("Invalid username or password".to_string());
                        }
                    }
                    "logout" => {
                        state.screen = Screen::Login;
                        state.fields.clear();
                        state.url = "https://sim.webpilot.test/login".to_string();
                    }
                    "remember" => state.remember_me = true,
                    _ => {}
                }
                Ok(())
            }
        }
    }
}

fn render(state: &SiteState, username: &str) -> RawPage {
    let elements = match state.screen {
        Screen::Login => {
            let mut elements = vec![
                RawElement::new("input")
                    .with_attr("type", "text")
                    .with_attr("name", "username")
                    .with_attr("id", "username")
                    .with_attr("aria-label", "Username"),
                RawElement::new("input")
                    .with_attr("type", "password")
                    .with_attr("name", "password")
                    .with_attr("id", "password")
                    .with_attr("aria-label", "Password"),
                RawElement::new("input")
                    .with_attr("type", "hidden")
                    .with_attr("name", "csrf")
                    .with_attr("value", "token"),
            ];
            if state.remember_me {
                elements.push(
                    RawElement::new("input")
                        .with_attr("type", "checkbox")
                        .with_attr("name", "remember")
                        .with_attr("aria-label", "Remember me"),
                );
            }
            elements.push(
                RawElement::new("button")
                    .with_text("Log in")
                    .with_attr("name", "submit")
                    .with_attr("data-testid", "login-submit"),
            );
            elements.push(
                RawElement::new("a")
                    .with_text("Forgot password?")
                    .with_attr("href", "/reset"),
            );
            if let Some(error) = &state.error {
                elements.push(RawElement::new("div").with_role("alert").with_text(error.clone()));
            }
            elements
        }
        Screen::Dashboard => vec![
            RawElement::new("h1").with_text(format!("Welcome, {}", username)),
            RawElement::new("button")
                .with_text("New form")
                .with_attr("name", "new-form"),
            RawElement::new("a")
                .with_text("Log out")
                .with_attr("name", "logout")
                .with_attr("href", "/logout"),
        ],
    };
    let title = match state.screen {
        Screen::Login => "Sign in",
        Screen::Dashboard => "Dashboard",
    };
    RawPage {
        url: state.url.clone(),
        title: title.to_string(),
        elements,
        screenshot: None,
    }
}

#[async_trait]
impl PageSource for LoginSite {
    async fn read_page(&self) -> Result<RawPage, String> {
        let mut state = self.state();
        state.reads += 1;
        Ok(render(&state, &self.username))
    }
}

#[async_trait]
impl ActionExecutor for LoginSite {
    async fn execute(&self, action: &Action) -> ExecutionReport {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.apply(action) {
            Ok(()) => ExecutionReport::ok(),
            Err(e) => ExecutionReport::failed(e),
        }
    }
}

type SiteFactory = dyn Fn() -> LoginSite + Send + Sync;

/// 每个会话一个独立的模拟站点
pub struct SimulatedProvider {
    factory: Box<SiteFactory>,
    sites: Mutex<HashMap<String, Arc<LoginSite>>>,
    released: Mutex<HashSet<String>>,
}

impl SimulatedProvider {
    pub fn new(factory: impl Fn() -> LoginSite + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            sites: Mutex::new(HashMap::new()),
            released: Mutex::new(HashSet::new()),
        }
    }

    /// 会话对应的站点（已释放的会话返回 None）
    pub fn site(&self, session_id: &str) -> Option<Arc<LoginSite>> {
        self.sites.lock().ok()?.get(session_id).cloned()
    }

    pub fn was_released(&self, session_id: &str) -> bool {
        self.released
            .lock()
            .map(|r| r.contains(session_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl PageProvider for SimulatedProvider {
    async fn acquire(&self, session_id: &str, start_url: &str) -> Result<PageHandles, String> {
        if start_url.trim().is_empty() {
            return Err("empty start url".to_string());
        }
        let site = Arc::new((self.factory)());
        self.sites
            .lock()
            .map_err(|e| e.to_string())?
            .insert(session_id.to_string(), Arc::clone(&site));
        tracing::debug!(session_id, start_url, "simulated site opened");
        Ok(PageHandles::new(site.clone(), site))
    }

    async fn release(&self, session_id: &str) {
        if let Ok(mut sites) = self.sites.lock() {
            sites.remove(session_id);
        }
        if let Ok(mut released) = self.released.lock() {
            released.insert(session_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_login_with_correct_credentials() {
        let site = LoginSite::new("alice", "secret");
        let user = site.element_id("Username").unwrap();
        let pass = site.element_id("Password").unwrap();
        let submit = site.element_id("Log in").unwrap();

        assert!(site.execute(&Action::type_text(user, "alice")).await.success);
        assert!(site.execute(&Action::type_text(pass, "secret")).await.success);
        assert!(site.execute(&Action::click(submit)).await.success);
        assert!(site.logged_in());
        assert!(site.element_id("Log out").is_some());
    }

    #[tokio::test]
    async fn test_wrong_password_shows_alert() {
        let site = LoginSite::new("alice", "secret");
        let submit = site.element_id("Log in").unwrap();
        site.execute(&Action::click(submit)).await;
        assert!(!site.logged_in());
        assert!(site.element_id("Invalid username or password").is_some());
    }

    #[tokio::test]
    async fn test_typing_into_button_fails() {
        let site = LoginSite::new("alice", "secret");
        let submit = site.element_id("Log in").unwrap();
        let report = site.execute(&Action::type_text(submit, "x")).await;
        assert!(!report.success);
        assert!(report.error_detail.unwrap().contains("does not accept text"));
    }

    #[tokio::test]
    async fn test_hidden_inputs_are_not_addressable() {
        let site = LoginSite::new("alice", "secret");
        let page = site.read_page().await.unwrap();
        let ids = assign_ids(&page.elements, MAX_ELEMENTS);
        assert_eq!(ids.len(), 4);
        assert_eq!(site.reads(), 1);
    }
}
