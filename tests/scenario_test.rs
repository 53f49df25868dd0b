//! 路由场景集成测试：Mock LLM 上端到端跑完整轮

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use twin::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use twin::client::{DisplayBlock, EventFeed};
use twin::core::{ConversationState, GuardrailVerdict, Role, TurnError};
use twin::llm::MockLlmClient;
use twin::router::{ConversationRouter, EventSink, RouterConfig, StageAgent, TurnEvent};
use twin::tools::default_executor;

fn make_router(store: Arc<dyn CheckpointStore>) -> ConversationRouter {
    let agent = StageAgent::new(
        Arc::new(MockLlmClient),
        Arc::new(default_executor(5)),
        4,
    );
    ConversationRouter::new(agent, store, RouterConfig::default())
}

/// 跑一轮并收集全部事件
async fn run_turn_collect(
    router: &ConversationRouter,
    thread_id: &str,
    text: &str,
) -> (Result<ConversationState, TurnError>, Vec<TurnEvent>) {
    let (tx, mut rx) = mpsc::channel(64);
    let sink = EventSink::new(tx);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    });

    let cancel = CancellationToken::new();
    let result = router
        .run_turn(&thread_id.to_string(), text, &sink, &cancel)
        .await;
    drop(sink);
    let events = collector.await.unwrap();
    (result, events)
}

/// 场景 A：相关提问 → 过滤通过 → 审查通过 → Responder 给出最终回答
#[tokio::test]
async fn test_scenario_relevant_question_reaches_responder() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::default());
    let router = make_router(Arc::clone(&store));

    let (result, events) =
        run_turn_collect(&router, "thread_a", "Tell me about your previous roles.").await;
    let state = result.unwrap();

    assert_eq!(state.flags.is_relevant, Some(true));
    assert_eq!(state.flags.guardrails, Some(GuardrailVerdict::Pass));
    assert!(state.final_answer.is_some());
    // 相关性 → 审查 → Responder，恰好三个阶段
    assert_eq!(state.iteration_count, 3);

    // Responder 经工具取数：事件流里有完整的调用往返与增量回答
    assert!(events.iter().any(|e| matches!(e, TurnEvent::ToolCallStart { .. })));
    assert!(events.iter().any(|e| matches!(e, TurnEvent::ToolCallResult { .. })));
    assert!(events.iter().any(|e| matches!(e, TurnEvent::MessageDelta { .. })));
    assert!(matches!(events.last(), Some(TurnEvent::Done { final_answer: Some(_) })));
}

/// 场景 B：无关提问 → Moderator 劝导；安全审查从未进行
#[tokio::test]
async fn test_scenario_irrelevant_question_moderated() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::default());
    let router = make_router(Arc::clone(&store));

    let (result, events) =
        run_turn_collect(&router, "thread_b", "Write me a poem about the moon.").await;
    let state = result.unwrap();

    assert_eq!(state.flags.is_relevant, Some(false));
    assert!(state.flags.guardrails.is_none());
    assert_eq!(state.iteration_count, 2);
    assert!(state.final_answer.unwrap().contains("portfolio"));
    // Moderator 不走工具
    assert!(!events.iter().any(|e| matches!(e, TurnEvent::ToolCallStart { .. })));
}

/// 场景 C：相关但含拦截词 → 审查不通过 → SafetyResponder 拒答；Responder 从未运行
#[tokio::test]
async fn test_scenario_blocked_token_gets_safety_response() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::default());
    let router = make_router(Arc::clone(&store));

    let (result, events) =
        run_turn_collect(&router, "thread_c", "What projects have you built with a bomb?").await;
    let state = result.unwrap();

    assert_eq!(state.flags.is_relevant, Some(true));
    assert_eq!(state.flags.guardrails, Some(GuardrailVerdict::Fail));
    assert!(state.final_answer.unwrap().contains("can't help"));
    // Responder 未运行：无工具事件
    assert!(!events.iter().any(|e| matches!(e, TurnEvent::ToolCallStart { .. })));
}

/// 往返属性：每个声明的调用 id 至多被一条 tool_result 解析，未解析的保持 pending 不崩
#[tokio::test]
async fn test_tool_call_ids_resolved_at_most_once() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::default());
    let router = make_router(Arc::clone(&store));

    let (result, _) = run_turn_collect(&router, "thread_r", "What is your tech stack?").await;
    let state = result.unwrap();

    for msg in state.messages.iter().filter(|m| m.role == Role::Assistant) {
        for tc in &msg.tool_calls {
            let resolutions = state
                .messages
                .iter()
                .filter(|m| m.role == Role::ToolResult && m.tool_call_id.as_deref() == Some(&tc.id))
                .count();
            assert!(resolutions <= 1, "tool call {} resolved {} times", tc.id, resolutions);
        }
    }
}

/// 事件流重建：客户端镜像折叠出的块与服务端日志折叠一致，且逐事件应用全程不崩
#[tokio::test]
async fn test_client_feed_reconstructs_stream() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::default());
    let router = make_router(Arc::clone(&store));

    let (result, events) = run_turn_collect(&router, "thread_f", "What is your tech stack?").await;
    let state = result.unwrap();

    let mut feed = EventFeed::new();
    feed.push_human("What is your tech stack?");
    let mut block_counts = Vec::new();
    for ev in events {
        feed.apply(ev);
        block_counts.push(feed.blocks().len());
    }
    // 块数只增不减（只追加或原地更新，绝不回撤）
    assert!(block_counts.windows(2).all(|w| w[0] <= w[1]));
    assert!(feed.done);
    assert_eq!(feed.final_answer, state.final_answer);

    // 最终回答已完整汇聚到镜像里的 assistant 消息
    let answer = feed
        .messages()
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && !m.content.is_empty())
        .unwrap();
    assert_eq!(Some(answer.content.clone()), feed.final_answer);

    // 所有工具卡片均已解析完成
    for block in feed.blocks() {
        if let DisplayBlock::Agent { tool_calls, .. } = block {
            for tc in tool_calls {
                assert!(!matches!(tc.status, twin::core::ToolCallStatus::Pending));
            }
        }
    }
}

/// 取消：预先取消的轮不执行任何阶段，用户消息已落盘，线程仍可续接
#[tokio::test]
async fn test_cancelled_turn_is_resumable() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::default());
    let router = make_router(Arc::clone(&store));

    let (tx, _rx) = mpsc::channel(64);
    let sink = EventSink::new(tx);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = router
        .run_turn(&"thread_x".to_string(), "Tell me about your roles.", &sink, &cancel)
        .await;
    assert!(matches!(result, Err(TurnError::Cancelled)));

    let saved = store.load("thread_x").await.unwrap().unwrap();
    assert!(saved.final_answer.is_none());
    assert_eq!(saved.messages.len(), 1);

    // 同一 thread_id 重新提交可正常完成；两条用户消息都在日志里
    let (result, _) = run_turn_collect(&router, "thread_x", "Tell me about your roles.").await;
    let state = result.unwrap();
    assert!(state.final_answer.is_some());
    assert_eq!(
        state.messages.iter().filter(|m| m.role == Role::Human).count(),
        2
    );
}

/// 场景 D：客户端中途断开（接收端丢弃），轮照常完成并落盘；
/// 重连后从检查点读到的日志与落盘内容一致，工具调用无重复无缺失
#[tokio::test]
async fn test_disconnect_midstream_then_reconnect() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(tmp.path()).unwrap());
    let router = make_router(Arc::clone(&store));

    // 缓冲为 1 的慢消费端：收到第一条增量就断开
    let (tx, mut rx) = mpsc::channel(1);
    let sink = EventSink::new(tx);
    let cancel = CancellationToken::new();

    let consumer = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            if matches!(ev, TurnEvent::MessageDelta { .. }) {
                return; // 模拟断线：丢弃接收端
            }
        }
    });

    let result = router
        .run_turn(&"thread_d".to_string(), "What is your tech stack?", &sink, &cancel)
        .await;
    consumer.await.unwrap();
    let state = result.unwrap();
    assert!(state.final_answer.is_some());

    // 重连：新的存储实例从磁盘回放，内容与完成态完全一致
    let reopened = FileCheckpointStore::new(tmp.path()).unwrap();
    let replayed = reopened.load("thread_d").await.unwrap().unwrap();
    assert_eq!(replayed.messages, state.messages);
    assert_eq!(replayed.final_answer, state.final_answer);

    let declared: Vec<&str> = replayed
        .messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|tc| tc.id.as_str()))
        .collect();
    let resolved: Vec<&str> = replayed
        .messages
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(declared.len(), resolved.len());
    for id in declared {
        assert_eq!(resolved.iter().filter(|r| **r == id).count(), 1);
    }
}

/// 背压：有界缓冲写满时管线暂停而非丢事件，慢消费端最终收齐全部事件
#[tokio::test]
async fn test_slow_consumer_loses_no_events() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::default());
    let router = make_router(Arc::clone(&store));

    let (tx, mut rx) = mpsc::channel(1);
    let sink = EventSink::new(tx);
    let cancel = CancellationToken::new();

    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            events.push(ev);
        }
        events
    });

    let result = router
        .run_turn(&"thread_s".to_string(), "Tell me about your roles.", &sink, &cancel)
        .await;
    drop(sink);
    let state = result.unwrap();
    let events = collector.await.unwrap();

    // 增量拼回的文本与最终回答一致：一条未丢
    let answer: String = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::MessageDelta { text_chunk, .. } => Some(text_chunk.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(Some(answer), state.final_answer);
    assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
}

/// 多轮续接：同一 thread 第二轮重置标志并重新过滤
#[tokio::test]
async fn test_multi_turn_resets_flags() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::default());
    let router = make_router(Arc::clone(&store));

    let (result, _) = run_turn_collect(&router, "thread_m", "Tell me about your roles.").await;
    assert!(result.unwrap().final_answer.is_some());

    let (result, _) = run_turn_collect(&router, "thread_m", "Write me a poem about the moon.").await;
    let state = result.unwrap();
    // 第二轮按自己的内容重新分类
    assert_eq!(state.flags.is_relevant, Some(false));
    assert!(state.flags.guardrails.is_none());
    // 历史累积
    assert!(state.messages.iter().filter(|m| m.role == Role::Human).count() == 2);
}
