//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 工具调用原样透传；要求结构化输出时切 JSON 模式并对 content 做尽力解析。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionTool, ChatCompletionToolType, CreateChatCompletionRequestArgs, FunctionCall,
    FunctionObjectArgs, ResponseFormat,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::{Message, Role};
use crate::llm::{GenerateRequest, GeneratedToolCall, Generation, LlmClient, LlmError};

/// OpenAI 兼容客户端：持有 Client 与 model 名，generate 时转 Message 为 API 格式
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    request_timeout: Duration,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        request_timeout_secs: u64,
    ) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            request_timeout: Duration::from_secs(request_timeout_secs),
        }
    }

    fn to_openai_messages(
        &self,
        system: &str,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut out = vec![ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system.to_string())
                .build()?,
        )];
        for m in messages {
            match m.role {
                Role::Human => out.push(ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                )),
                Role::Assistant => {
                    let mut args = ChatCompletionRequestAssistantMessageArgs::default();
                    args.content(m.content.clone());
                    if !m.tool_calls.is_empty() {
                        let calls: Vec<ChatCompletionMessageToolCall> = m
                            .tool_calls
                            .iter()
                            .map(|tc| ChatCompletionMessageToolCall {
                                id: tc.id.clone(),
                                r#type: ChatCompletionToolType::Function,
                                function: FunctionCall {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.to_string(),
                                },
                            })
                            .collect();
                        args.tool_calls(calls);
                    }
                    out.push(ChatCompletionRequestMessage::Assistant(args.build()?));
                }
                Role::ToolResult => out.push(ChatCompletionRequestMessage::Tool(
                    ChatCompletionRequestToolMessageArgs::default()
                        .content(m.content.clone())
                        .tool_call_id(m.tool_call_id.clone().unwrap_or_default())
                        .build()?,
                )),
            }
        }
        Ok(out)
    }
}

/// 错误映射：限流 / 网络类归为可重试，其余归 Api
fn map_openai_error(e: OpenAIError) -> LlmError {
    match e {
        OpenAIError::Reqwest(inner) => LlmError::Network(inner.to_string()),
        OpenAIError::ApiError(api) => {
            if api.code.as_deref() == Some("rate_limit_exceeded") {
                LlmError::RateLimited
            } else {
                LlmError::Api(api.message)
            }
        }
        other => LlmError::Api(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, req: GenerateRequest<'_>) -> Result<Generation, LlmError> {
        let messages = self
            .to_openai_messages(req.system, req.messages)
            .map_err(map_openai_error)?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(messages);

        if let Some(tools) = req.tools {
            let api_tools: Result<Vec<ChatCompletionTool>, OpenAIError> = tools
                .iter()
                .map(|t| {
                    Ok(ChatCompletionTool {
                        r#type: ChatCompletionToolType::Function,
                        function: FunctionObjectArgs::default()
                            .name(t.name.clone())
                            .description(t.description.clone())
                            .parameters(t.parameters.clone())
                            .build()?,
                    })
                })
                .collect();
            builder.tools(api_tools.map_err(map_openai_error)?);
        }
        if req.response_schema.is_some() {
            builder.response_format(ResponseFormat::JsonObject);
        }

        let request = builder.build().map_err(map_openai_error)?;

        let response = tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(map_openai_error)?;

        let choice = response.choices.into_iter().next().ok_or(LlmError::EmptyResponse)?;

        let content = choice.message.content.unwrap_or_default();
        let tool_calls: Vec<GeneratedToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| GeneratedToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        if content.is_empty() && tool_calls.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        let structured = if req.response_schema.is_some() {
            serde_json::from_str(&content).ok()
        } else {
            None
        };

        Ok(Generation {
            content,
            tool_calls,
            structured,
        })
    }
}
