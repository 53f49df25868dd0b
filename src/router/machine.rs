//! 会话路由器：阶段选择与单轮主循环
//!
//! 每个阶段完成后按优先级转移表决定下一阶段；每次阶段执行后保存检查点（中途崩溃最多丢一个阶段），
//! 支持取消（当前阶段跑完、结果落盘但不再展示）、阶段超时与有界重试、迭代上限熔断。
//! 同一 thread 内严格串行；不同 thread 彼此独立并发。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::config::RouterSection;
use crate::core::{
    ConversationState, GuardrailVerdict, Message, Role, StageFailure, ThreadId, TurnError,
};
use crate::router::events::{EventSink, TurnEvent};
use crate::router::stage::{Stage, StageAgent, StageUpdate};

/// 流式回复时每段字符数（模拟打字效果）
const CHUNK_CHARS: usize = 6;

/// 路由器配置（从 [router] 配置段取值）
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_iterations: u32,
    pub stage_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl From<&RouterSection> for RouterConfig {
    fn from(s: &RouterSection) -> Self {
        Self {
            max_iterations: s.max_iterations,
            stage_timeout_secs: s.stage_timeout_secs,
            max_retries: s.max_retries,
            retry_backoff_ms: s.retry_backoff_ms,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from(&RouterSection::default())
    }
}

/// 会话路由器：拥有状态机；一轮内独占 ConversationState
pub struct ConversationRouter {
    agent: StageAgent,
    store: Arc<dyn CheckpointStore>,
    config: RouterConfig,
}

impl ConversationRouter {
    pub fn new(agent: StageAgent, store: Arc<dyn CheckpointStore>, config: RouterConfig) -> Self {
        Self {
            agent,
            store,
            config,
        }
    }

    /// 转移表：按优先级决定下一阶段；None 表示停机
    pub fn next_stage(state: &ConversationState) -> Option<Stage> {
        // 本轮已有回答则停机（「运行后即停」的回答类阶段）
        if state.final_answer.is_some() || state.assistant_output_this_turn() {
            return None;
        }
        // 首个阶段必为相关性过滤
        if state.iteration_count == 0 {
            return Some(Stage::RelevanceFilter);
        }
        match state.flags.is_relevant {
            // 防御性重入：标志缺失时重跑过滤，而非带着未知状态继续
            None => Some(Stage::RelevanceFilter),
            Some(false) => Some(Stage::Moderator),
            Some(true) => match state.flags.guardrails {
                None => Some(Stage::GuardrailCheck),
                Some(GuardrailVerdict::Pass) => Some(Stage::Responder),
                Some(GuardrailVerdict::Fail) => Some(Stage::SafetyResponder),
            },
        }
    }

    /// 跑完整一轮：装载/创建状态 → 逐阶段执行 → 每阶段后落检查点并推送事件 → Done
    ///
    /// 出错时状态停留在最后一次成功保存的形态；error 事件由调用方（传输层）根据返回值发出。
    pub async fn run_turn(
        &self,
        thread_id: &ThreadId,
        text: &str,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<ConversationState, TurnError> {
        let mut state = self
            .store
            .load(thread_id)
            .await?
            .unwrap_or_else(|| ConversationState::new(thread_id.clone()));
        state.begin_turn(text);
        // 用户消息先落盘，刷新/断线后历史不丢
        self.store.save(&state).await?;

        loop {
            if cancel.is_cancelled() {
                tracing::info!(thread_id = %thread_id, "turn cancelled before next stage");
                return Err(TurnError::Cancelled);
            }

            let Some(stage) = Self::next_stage(&state) else {
                if state.assistant_output_this_turn() {
                    break;
                }
                // 停机分支且无任何回答：缺陷信号，绝不静默
                tracing::error!(thread_id = %thread_id, "router halted with no assistant output");
                return Err(TurnError::RoutingInconsistency);
            };

            if state.iteration_count >= self.config.max_iterations {
                tracing::error!(
                    thread_id = %thread_id,
                    ceiling = self.config.max_iterations,
                    "iteration ceiling exceeded, aborting turn"
                );
                return Err(TurnError::IterationCeiling(self.config.max_iterations));
            }

            tracing::info!(
                thread_id = %thread_id,
                stage = stage.name(),
                iteration = state.iteration_count,
                "running stage"
            );
            let update = self.run_stage_with_retry(stage, &state, events).await?;
            let streamed = Self::apply_update(&mut state, update);
            state.iteration_count += 1;
            self.store.save(&state).await?;

            // 取消到达时当前阶段已跑完：结果已应用并落盘（可续接），但不再向客户端展示
            if cancel.is_cancelled() {
                tracing::info!(thread_id = %thread_id, "turn cancelled, stage output checkpointed but not displayed");
                return Err(TurnError::Cancelled);
            }

            for message in streamed {
                self.emit_answer(events, &message).await;
            }
        }

        events
            .send(TurnEvent::Done {
                final_answer: state.final_answer.clone(),
            })
            .await;
        Ok(state)
    }

    /// 带截止与有界重试执行单个阶段；可重试失败按尝试次数线性退避
    async fn run_stage_with_retry(
        &self,
        stage: Stage,
        state: &ConversationState,
        events: &EventSink,
    ) -> Result<StageUpdate, TurnError> {
        let deadline = Duration::from_secs(self.config.stage_timeout_secs);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let failure =
                match tokio::time::timeout(deadline, self.agent.invoke(stage, state, events)).await
                {
                    Ok(Ok(update)) => return Ok(update),
                    Ok(Err(f)) => f,
                    Err(_) => StageFailure::Timeout(self.config.stage_timeout_secs),
                };

            if failure.retryable() && attempt <= self.config.max_retries {
                tracing::warn!(
                    stage = stage.name(),
                    attempt,
                    error = %failure,
                    "stage failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(
                    self.config.retry_backoff_ms * attempt as u64,
                ))
                .await;
                continue;
            }

            return Err(TurnError::StageExhausted {
                stage: stage.name(),
                attempts: attempt,
                source: failure,
            });
        }
    }

    /// 应用阶段更新；返回需要向客户端流式展示的 assistant 消息
    fn apply_update(state: &mut ConversationState, update: StageUpdate) -> Vec<Message> {
        match update {
            StageUpdate::Relevance { is_relevant } => {
                state.flags.is_relevant = Some(is_relevant);
                Vec::new()
            }
            StageUpdate::Guardrail { verdict } => {
                state.flags.guardrails = Some(verdict);
                Vec::new()
            }
            StageUpdate::Answer {
                messages,
                final_answer,
            } => {
                let streamed: Vec<Message> = messages
                    .iter()
                    .filter(|m| m.role == Role::Assistant)
                    .cloned()
                    .collect();
                for m in messages {
                    state.push_message(m);
                }
                // final_answer 一轮至多设置一次
                if state.final_answer.is_none() {
                    state.final_answer = Some(final_answer);
                }
                streamed
            }
        }
    }

    /// 将回答内容按固定块大小拆为 message_delta，随后 message_complete
    async fn emit_answer(&self, events: &EventSink, message: &Message) {
        let chars: Vec<char> = message.content.chars().collect();
        for chunk in chars.chunks(CHUNK_CHARS) {
            events
                .send(TurnEvent::MessageDelta {
                    message_id: message.id.clone(),
                    text_chunk: chunk.iter().collect(),
                })
                .await;
        }
        events
            .send(TurnEvent::MessageComplete {
                message_id: message.id.clone(),
            })
            .await;
    }
}
