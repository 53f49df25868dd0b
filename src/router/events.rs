//! 轮事件：路由器经传输层推送给客户端的有序事件
//!
//! 同一 message_id 的事件保持产出顺序；不同消息之间可交错（工具调用可先于上一文本块完成）。

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::ToolCallStatus;

/// 单条轮事件（序列化为一行 JSON 供 ndjson 流）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 流首行：线程 ID（提交时为空则新建并回传）
    Thread { thread_id: String },
    /// 进行中 assistant 消息的增量文本
    MessageDelta { message_id: String, text_chunk: String },
    /// 工具调用开始；参数可能分片到达
    ToolCallStart {
        message_id: String,
        tool_call_id: String,
        name: String,
        args_chunk: String,
    },
    /// 工具调用结果
    ToolCallResult {
        tool_call_id: String,
        status: ToolCallStatus,
        result: String,
    },
    /// 消息完成
    MessageComplete { message_id: String },
    /// 错误（人类可读，附错误码）
    Error { code: String, message: String },
    /// 轮结束
    Done { final_answer: Option<String> },
}

/// 有界事件发送端：写满时 send 挂起，阶段管线随之暂停（背压而非丢弃）。
/// 客户端断开导致接收端关闭时静默忽略，路由照常跑完并落检查点。
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<TurnEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<TurnEvent>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, event: TurnEvent) {
        let _ = self.tx.send(event).await;
    }
}
