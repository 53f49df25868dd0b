//! 会话状态：消息日志、路由标志与最终回答
//!
//! ConversationState 在一轮内由 Router 独占持有，各阶段只产出增量更新；
//! 轮间交给 Checkpoint Store 持久化，同一 thread_id 可无限续接。

use serde::{Deserialize, Serialize};

/// 线程 ID（跨轮持久，客户端持有用于续接）
pub type ThreadId = String;

/// 生成新的线程 ID
pub fn new_thread_id() -> ThreadId {
    format!("thread_{}", uuid::Uuid::new_v4())
}

fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4())
}

/// 消息角色（与事件流一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Human,
    Assistant,
    ToolResult,
}

/// 工具调用状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Complete,
    Error,
}

/// 单次工具调用：由 assistant 消息声明，同 id 的 tool_result 消息使其转为 Complete/Error（恰好一次）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// 参数；流式到达时可能是未解析完的片段，以 Value::String 原样保留
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ToolCall {
    pub fn pending(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            status: ToolCallStatus::Pending,
            result: None,
        }
    }
}

/// 单条消息：日志仅追加，保持到达顺序，永不重排
///
/// tool_calls 仅 Assistant 角色使用；tool_call_id / tool_status 仅 ToolResult 角色使用。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// 流式进行中可能为空
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_status: Option<ToolCallStatus>,
}

impl Message {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::Human,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_status: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_status: None,
        }
    }

    /// 工具结果消息：携带对应调用 id 与成败状态
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        status: ToolCallStatus,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: new_message_id(),
            role: Role::ToolResult,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            tool_status: Some(status),
        }
    }

    /// 指定 id 构造（客户端镜像从事件流还原消息时使用）
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// 安全审查结论
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailVerdict {
    Pass,
    Fail,
}

/// 路由标志：封闭字段集合（非开放 kv 袋），一轮内一经设置不再清除
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingFlags {
    pub is_relevant: Option<bool>,
    pub guardrails: Option<GuardrailVerdict>,
}

/// 会话线程的完整状态
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationState {
    pub thread_id: ThreadId,
    pub messages: Vec<Message>,
    pub flags: RoutingFlags,
    /// 本轮最终回答；一轮内至多设置一次
    pub final_answer: Option<String>,
    /// 本轮已执行的阶段数，随每次阶段执行单调递增
    pub iteration_count: u32,
    /// 线程创建时间（RFC 3339）
    pub created_at: String,
    /// 本轮起点在消息日志中的下标（用于判断本轮是否已有 assistant 输出）
    #[serde(default)]
    turn_start: usize,
}

impl ConversationState {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            messages: Vec::new(),
            flags: RoutingFlags::default(),
            final_answer: None,
            iteration_count: 0,
            created_at: chrono::Utc::now().to_rfc3339(),
            turn_start: 0,
        }
    }

    /// 开启新一轮：追加用户消息，重置本轮标志、回答与阶段计数
    pub fn begin_turn(&mut self, text: impl Into<String>) -> &Message {
        self.turn_start = self.messages.len();
        self.flags = RoutingFlags::default();
        self.final_answer = None;
        self.iteration_count = 0;
        self.messages.push(Message::human(text));
        self.messages.last().unwrap()
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// 本轮（当前用户消息之后）是否已有 assistant 输出
    pub fn assistant_output_this_turn(&self) -> bool {
        self.messages[self.turn_start..]
            .iter()
            .any(|m| m.role == Role::Assistant)
    }

    /// 最近一条用户消息
    pub fn last_human(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Human)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_turn_resets_flags() {
        let mut state = ConversationState::new(new_thread_id());
        state.begin_turn("first");
        state.flags.is_relevant = Some(true);
        state.flags.guardrails = Some(GuardrailVerdict::Pass);
        state.final_answer = Some("answer".to_string());
        state.iteration_count = 3;

        state.begin_turn("second");
        assert!(state.flags.is_relevant.is_none());
        assert!(state.flags.guardrails.is_none());
        assert!(state.final_answer.is_none());
        assert_eq!(state.iteration_count, 0);
        assert_eq!(state.messages.len(), 2);
    }

    #[test]
    fn test_assistant_output_scoped_to_turn() {
        let mut state = ConversationState::new(new_thread_id());
        state.begin_turn("q1");
        state.push_message(Message::assistant("a1"));
        assert!(state.assistant_output_this_turn());

        state.begin_turn("q2");
        assert!(!state.assistant_output_this_turn());
    }

    #[test]
    fn test_tool_result_message_carries_status() {
        let msg = Message::tool_result("call_1", ToolCallStatus::Error, "boom");
        assert!(matches!(msg.role, Role::ToolResult));
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(matches!(msg.tool_status, Some(ToolCallStatus::Error)));
    }

    #[test]
    fn test_state_roundtrips_through_json() {
        let mut state = ConversationState::new("thread_x".to_string());
        state.begin_turn("hello");
        let mut m = Message::assistant("");
        m.tool_calls.push(ToolCall::pending("c1", "profile_lookup", serde_json::json!({"section": "skills"})));
        state.push_message(m);

        let json = serde_json::to_string(&state).unwrap();
        let back: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.messages.len(), 2);
        assert_eq!(back.messages[1].tool_calls[0].name, "profile_lookup");
        assert!(back.assistant_output_this_turn());
    }
}
