//! Web 传输层：把路由器的逐阶段产出以 ndjson 事件流转发给客户端
//!
//! 一轮一条连接，首行回传 thread_id；断线重连走 /api/thread/state 回放完整检查点状态，
//! 而非只补断点后的增量。配置 api_token 后所有业务接口要求 Bearer 认证，
//! 未通过在进入路由器之前即被拒绝。传输层只转发、不改写事件内容。

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::stream::{self, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointStore, ThreadSummary};
use crate::config::{AppConfig, WebSection};
use crate::core::{new_thread_id, Message, TurnError};
use crate::router::{ConversationRouter, EventSink, TurnEvent};

/// 应用共享状态
pub struct AppState {
    pub config: AppConfig,
    pub router: Arc<ConversationRouter>,
    pub store: Arc<dyn CheckpointStore>,
    /// 进行中的轮：thread_id -> 取消令牌；同线程重复提交会先取消旧轮
    active: RwLock<HashMap<String, CancellationToken>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        router: Arc<ConversationRouter>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            router,
            store,
            active: RwLock::new(HashMap::new()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub thread_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StateQuery {
    pub thread_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ThreadsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// 重连回放：完整的已落盘状态
#[derive(Debug, Serialize)]
pub struct ThreadStateResponse {
    pub thread_id: String,
    pub created_at: String,
    pub messages: Vec<Message>,
    pub final_answer: Option<String>,
}

/// Bearer 认证：未配置 api_token 时放行
fn check_auth(cfg: &WebSection, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let Some(expected) = cfg.api_token.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            "missing or invalid bearer token".to_string(),
        ))
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat/stream", post(api_chat_stream))
        .route("/api/chat/cancel", post(api_chat_cancel))
        .route("/api/thread/state", get(api_thread_state))
        .route("/api/threads", get(api_threads_list))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(state)
}

/// POST /api/chat/stream：提交一条用户消息，返回本轮事件的 ndjson 流（首行为 thread_id）
async fn api_chat_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response, (StatusCode, String)> {
    check_auth(&state.config.web, &headers)?;

    let text = req.text.trim().to_string();
    if text.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "text is required".to_string()));
    }

    let thread_id = req
        .thread_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(new_thread_id);

    let token = CancellationToken::new();
    {
        let mut active = state.active.write().await;
        if let Some(old) = active.insert(thread_id.clone(), token.clone()) {
            old.cancel();
            tracing::info!(thread_id = %thread_id, "cancelling in-flight turn for resubmission");
        }
    }

    let (event_tx, event_rx) = mpsc::channel::<TurnEvent>(state.config.stream.buffer_size);
    let sink = EventSink::new(event_tx);

    let router = Arc::clone(&state.router);
    let state_spawn = Arc::clone(&state);
    let thread_id_spawn = thread_id.clone();
    let token_spawn = token.clone();
    tokio::spawn(async move {
        match router
            .run_turn(&thread_id_spawn, &text, &sink, &token_spawn)
            .await
        {
            Ok(_) => {}
            Err(TurnError::Cancelled) => {
                tracing::info!(thread_id = %thread_id_spawn, "turn cancelled");
            }
            Err(e) => {
                tracing::warn!(thread_id = %thread_id_spawn, error = %e, "turn failed");
                sink.send(TurnEvent::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                })
                .await;
            }
        }
        // 仅当未被新提交替换时摘除活跃表项
        if !token_spawn.is_cancelled() {
            state_spawn.active.write().await.remove(&thread_id_spawn);
        }
    });

    let first_line = format!(
        "{}\n",
        serde_json::to_string(&TurnEvent::Thread {
            thread_id: thread_id.clone(),
        })
        .unwrap()
    );

    let stream = stream::try_unfold(
        (event_rx, Some(first_line)),
        |(mut event_rx, first_line_opt)| async move {
            if let Some(line) = first_line_opt {
                return Ok::<_, std::convert::Infallible>(Some((Bytes::from(line), (event_rx, None))));
            }
            match event_rx.recv().await {
                Some(ev) => {
                    let line = format!("{}\n", serde_json::to_string(&ev).unwrap());
                    Ok(Some((Bytes::from(line), (event_rx, None))))
                }
                None => Ok(None),
            }
        },
    );

    type BoxErr = Box<dyn std::error::Error + Send + Sync>;
    let stream = stream.map_err(|e: std::convert::Infallible| Box::new(e) as BoxErr);

    let mut res = Response::new(Body::from_stream(stream));
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        "application/x-ndjson; charset=utf-8".parse().unwrap(),
    );
    Ok(res)
}

/// POST /api/chat/cancel：取消线程的在途轮；当前阶段跑完后停机，线程可续接
async fn api_chat_cancel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CancelRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    check_auth(&state.config.web, &headers)?;

    let mut active = state.active.write().await;
    match active.remove(&req.thread_id) {
        Some(token) => {
            token.cancel();
            tracing::info!(thread_id = %req.thread_id, "cancel requested");
            Ok(StatusCode::OK)
        }
        None => Err((
            StatusCode::NOT_FOUND,
            format!("no in-flight turn for thread {}", req.thread_id),
        )),
    }
}

/// GET /api/thread/state?thread_id=：断线重连回放完整落盘状态
async fn api_thread_state(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<StateQuery>,
) -> Result<Json<ThreadStateResponse>, (StatusCode, String)> {
    check_auth(&state.config.web, &headers)?;

    let loaded = state
        .store
        .load(&q.thread_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    match loaded {
        Some(s) => Ok(Json(ThreadStateResponse {
            thread_id: s.thread_id,
            created_at: s.created_at,
            messages: s.messages,
            final_answer: s.final_answer,
        })),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("unknown thread {}", q.thread_id),
        )),
    }
}

/// GET /api/threads?limit=：历史线程列表（只读）
async fn api_threads_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<ThreadsQuery>,
) -> Result<Json<Vec<ThreadSummary>>, (StatusCode, String)> {
    check_auth(&state.config.web, &headers)?;

    let items = state
        .store
        .list(q.limit.unwrap_or(20))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(items))
}
