//! 核心类型：会话状态与错误分类

pub mod error;
pub mod state;

pub use error::{CheckpointError, StageFailure, TurnError};
pub use state::{
    new_thread_id, ConversationState, GuardrailVerdict, Message, Role, RoutingFlags, ThreadId,
    ToolCall, ToolCallStatus,
};
