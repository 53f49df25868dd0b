//! 会话路由：阶段集合、状态机与轮事件

pub mod events;
pub mod machine;
pub mod stage;

pub use events::{EventSink, TurnEvent};
pub use machine::{ConversationRouter, RouterConfig};
pub use stage::{Stage, StageAgent, StageUpdate};
