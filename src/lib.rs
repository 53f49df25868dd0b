//! Twin - AI 分身对话服务
//!
//! 模块划分：
//! - **checkpoint**: 线程状态检查点（内存 / JSON 文件，按线程串行写入）
//! - **client**: 客户端核心（事件折叠、展示块重建）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话状态与错误分类
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **router**: 阶段集合、状态机与轮事件
//! - **tools**: 档案内容查询边界（外部协作方接口）
//! - **web**: ndjson 流式传输、重连回放与认证门

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod router;
pub mod tools;
pub mod web;
