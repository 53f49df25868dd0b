//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::generate：输入消息与可选工具/结构化要求，
//! 输出文本内容、工具调用与结构化 JSON。后端内部的重试与超时语义由各自实现裹挟，
//! 阶段层只看 LlmError 的可重试分类。

use async_trait::async_trait;
use thiserror::Error;

use crate::core::Message;

/// LLM 错误（带可重试分类）
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited by provider")]
    RateLimited,

    #[error("api error: {0}")]
    Api(String),

    #[error("empty response from model")]
    EmptyResponse,
}

impl LlmError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Network(_) | LlmError::Timeout | LlmError::RateLimited | LlmError::EmptyResponse
        )
    }
}

/// 暴露给模型的工具声明（parameters 为 JSON Schema）
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// 模型请求的一次工具调用；arguments 为原始字符串，可能是未完成的 JSON 片段
#[derive(Debug, Clone)]
pub struct GeneratedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// 一次生成请求
pub struct GenerateRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [Message],
    pub tools: Option<&'a [ToolSpec]>,
    /// 要求 JSON 输出并按此 Schema 解析（Schema 同时拼入提示词）
    pub response_schema: Option<&'a serde_json::Value>,
}

/// 生成结果：content 与 tool_calls 可并存；structured 仅在要求结构化输出时尝试解析
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub content: String,
    pub tool_calls: Vec<GeneratedToolCall>,
    pub structured: Option<serde_json::Value>,
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, req: GenerateRequest<'_>) -> Result<Generation, LlmError>;
}
