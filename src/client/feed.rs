//! 事件折叠器：把轮事件流折叠为本地消息日志镜像
//!
//! 镜像只追加、不改写权威日志的既有内容；挂起仅在无新事件时发生，消费不阻塞生产方。
//! 增量先于 start 到达、参数分片为不完整 JSON 等部分数据一律容忍：先占位，后补全。

use std::collections::HashMap;

use crate::client::reconstruct::{group_messages, DisplayBlock};
use crate::core::{Message, Role, ToolCall, ToolCallStatus};
use crate::router::TurnEvent;

/// 单个线程的客户端镜像
#[derive(Debug, Default)]
pub struct EventFeed {
    pub thread_id: Option<String>,
    messages: Vec<Message>,
    /// 正在流式接收的消息 id
    streaming: Option<String>,
    pub final_answer: Option<String>,
    /// 最近一次 error 事件（code, message）
    pub last_error: Option<(String, String)>,
    pub done: bool,
    /// 工具参数分片缓冲：tool_call_id -> 原始累积串
    args_raw: HashMap<String, String>,
}

impl EventFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// 断线重连：用服务端回放的完整状态重建镜像
    pub fn replace_from_state(&mut self, messages: Vec<Message>, final_answer: Option<String>) {
        self.messages = messages;
        self.final_answer = final_answer;
        self.streaming = None;
        self.args_raw.clear();
    }

    /// 本地乐观追加用户消息（提交时即上屏）
    pub fn push_human(&mut self, text: impl Into<String>) -> String {
        let msg = Message::human(text);
        let id = msg.id.clone();
        self.messages.push(msg);
        id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 当前展示块（确定性重算）
    pub fn blocks(&self) -> Vec<DisplayBlock> {
        group_messages(&self.messages, self.streaming.as_deref())
    }

    /// 应用一条事件
    pub fn apply(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::Thread { thread_id } => {
                self.thread_id = Some(thread_id);
                self.done = false;
                self.last_error = None;
            }
            TurnEvent::MessageDelta {
                message_id,
                text_chunk,
            } => {
                let msg = self.assistant_mut(&message_id);
                msg.content.push_str(&text_chunk);
                self.streaming = Some(message_id);
            }
            TurnEvent::ToolCallStart {
                message_id,
                tool_call_id,
                name,
                args_chunk,
            } => {
                let raw = self.args_raw.entry(tool_call_id.clone()).or_default();
                raw.push_str(&args_chunk);
                // 尽力解析；未完成的片段原样保留为字符串，块不丢弃
                let parsed = serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));

                let msg = self.assistant_mut(&message_id);
                match msg.tool_calls.iter_mut().find(|tc| tc.id == tool_call_id) {
                    Some(tc) => tc.arguments = parsed,
                    None => msg
                        .tool_calls
                        .push(ToolCall::pending(tool_call_id, name, parsed)),
                }
            }
            TurnEvent::ToolCallResult {
                tool_call_id,
                status,
                result,
            } => {
                self.messages
                    .push(Message::tool_result(tool_call_id, status, result));
            }
            TurnEvent::MessageComplete { message_id } => {
                if self.streaming.as_deref() == Some(message_id.as_str()) {
                    self.streaming = None;
                }
            }
            TurnEvent::Error { code, message } => {
                self.last_error = Some((code, message));
            }
            TurnEvent::Done { final_answer } => {
                self.final_answer = final_answer;
                self.streaming = None;
                self.done = true;
            }
        }
    }

    /// 按 id 找到 assistant 消息；增量先于声明到达时先占位
    fn assistant_mut(&mut self, message_id: &str) -> &mut Message {
        if let Some(idx) = self
            .messages
            .iter()
            .position(|m| m.id == message_id && m.role == Role::Assistant)
        {
            return &mut self.messages[idx];
        }
        self.messages
            .push(Message::assistant("").with_id(message_id));
        self.messages.last_mut().unwrap()
    }
}
