//! Webpilot 演示入口
//!
//! 加载配置、初始化日志，对内置模拟登录站点（或启用 browser feature 时的真实页面）
//! 逐回合运行一个会话并打印每回合结果。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use webpilot::config::load_config;
use webpilot::core::SessionStatus;
use webpilot::knowledge::{InMemoryKnowledgeStore, KnowledgeRetriever};
use webpilot::llm::create_embedder_from_config;
use webpilot::session::PageProvider;
use webpilot::sim::{LoginSite, SimulatedProvider};
use webpilot::{create_session_manager, observability};

#[derive(Parser, Debug)]
#[command(name = "webpilot", about = "Turn-based web automation agent")]
struct Cli {
    /// 额外的配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "Log in with username=alice password=secret")]
    objective: String,

    #[arg(long, default_value = "https://sim.webpilot.test/login")]
    url: String,

    /// 启用知识检索（内置几条帮助文档）
    #[arg(long)]
    knowledge: bool,

    /// 第一个回合之前先问的问题
    #[arg(long)]
    ask: Option<String>,

    #[arg(long, default_value_t = 12)]
    max_turns: u32,

    /// 以 JSON 打印决策事件
    #[arg(long)]
    events: bool,

    /// 使用 headless Chrome 打开 --url
    #[cfg(feature = "browser")]
    #[arg(long)]
    browser: bool,
}

const HELP_PASSAGES: &[(&str, &str)] = &[
    (
        "help/password",
        "To reset your password, click \"Forgot password?\" on the sign in page and follow the link sent to your email.",
    ),
    (
        "help/login",
        "Sign in with your username and password, then press the Log in button.",
    ),
    (
        "help/forms",
        "After signing in, use the New form button on the dashboard to start a new request.",
    ),
];

async fn help_store(cfg: &webpilot::config::AppConfig) -> Arc<dyn KnowledgeRetriever> {
    let mut store = InMemoryKnowledgeStore::new();
    if let Some(embedder) =
        create_embedder_from_config(cfg.llm.base_url.as_deref(), &cfg.llm.embedding_model)
    {
        store = store.with_embedder(embedder);
    }
    for (source, text) in HELP_PASSAGES {
        store.add_passage(*source, *text).await;
    }
    Arc::new(store)
}

fn simulated_site() -> Arc<dyn PageProvider> {
    Arc::new(SimulatedProvider::new(|| LoginSite::new("alice", "secret")))
}

#[cfg(feature = "browser")]
fn page_provider(cli: &Cli, cfg: &webpilot::config::AppConfig) -> Arc<dyn PageProvider> {
    if cli.browser {
        return Arc::new(
            webpilot::perception::browser::ChromeProvider::new(cfg.perception.max_elements)
                .with_screenshots(cfg.perception.vision_enabled),
        );
    }
    simulated_site()
}

#[cfg(not(feature = "browser"))]
fn page_provider(_cli: &Cli, _cfg: &webpilot::config::AppConfig) -> Arc<dyn PageProvider> {
    simulated_site()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;

    let retriever = if cli.knowledge || cfg.knowledge.enabled_by_default {
        Some(help_store(&cfg).await)
    } else {
        None
    };

    let event_tx = if cli.events {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&ev) {
                    println!("  event {}", line);
                }
            }
        });
        Some(tx)
    } else {
        None
    };

    let manager = create_session_manager(&cfg, page_provider(&cli, &cfg), retriever, event_tx);
    let session_id = manager
        .init(&cli.objective, &cli.url, Some(cli.knowledge))
        .await
        .context("Failed to start session")?;
    println!("session {} started: {}", session_id, cli.objective);

    if let Some(question) = &cli.ask {
        let resp = manager.next_action(&session_id, Some(question.as_str())).await?;
        println!("[{}] Q: {}\n    A: {}", resp.status, question, resp.message);
    }

    for _ in 0..cli.max_turns {
        let resp = manager
            .next_action(&session_id, None)
            .await
            .context("Turn failed")?;
        let action = resp
            .action
            .as_ref()
            .map(|a| a.describe())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "#{} [{}] {} | {}",
            resp.step_seq.unwrap_or_default(),
            resp.status,
            action,
            resp.message
        );
        if resp.status != SessionStatus::Active {
            break;
        }
    }

    let snapshot = manager.snapshot(&session_id).await?;
    println!(
        "finished with {} after {} step(s)",
        snapshot.status,
        snapshot.history.len()
    );
    manager.close(&session_id).await?;
    Ok(())
}
