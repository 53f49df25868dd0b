//! Twin 服务端
//!
//! 启动: cargo run
//! 提交: curl -N -X POST http://127.0.0.1:8080/api/chat/stream \
//!       -H 'content-type: application/json' -d '{"text": "Tell me about your previous roles."}'

use std::sync::Arc;

use twin::checkpoint::create_checkpoint_store;
use twin::config::load_config;
use twin::llm::create_llm_from_config;
use twin::router::{ConversationRouter, RouterConfig, StageAgent};
use twin::tools::default_executor;
use twin::web::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    twin::observability::init();

    let cfg = load_config(None).unwrap_or_default();
    if let Some(ref name) = cfg.app.name {
        tracing::info!("Starting {}", name);
    }

    let llm = create_llm_from_config(&cfg);
    let store = create_checkpoint_store(&cfg.checkpoint);
    let executor = Arc::new(default_executor(cfg.router.stage_timeout_secs));
    let agent = StageAgent::new(llm, executor, cfg.router.max_tool_rounds);
    let router = Arc::new(ConversationRouter::new(
        agent,
        Arc::clone(&store),
        RouterConfig::from(&cfg.router),
    ));

    let port = std::env::var("TWIN_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(cfg.web.port);

    let state = Arc::new(AppState::new(cfg, router, store));
    let app = build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Twin listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
