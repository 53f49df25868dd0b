//! 客户端核心：事件折叠与展示块重建（渲染样式不在此层）

pub mod feed;
pub mod reconstruct;

pub use feed::EventFeed;
pub use reconstruct::{group_messages, DisplayBlock, ToolCallView};
