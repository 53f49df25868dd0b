//! Mock LLM 客户端（用于测试与无 Key 离线运行）
//!
//! 按提示词中的阶段标记与最后一条用户消息的关键词规则，模拟五个阶段的输出：
//! 相关性/安全审查返回结构化 JSON，Responder 先发一次档案查询工具调用再给出回答。

use async_trait::async_trait;

use crate::core::{Message, Role};
use crate::llm::{GenerateRequest, GeneratedToolCall, Generation, LlmClient, LlmError};

/// 视为「与档案相关」的关键词
const RELEVANT_KEYWORDS: &[&str] = &[
    "role", "experience", "tech", "stack", "project", "built", "education", "skill", "work",
    "hire", "contact", "reach",
];

/// 安全审查拦截的词
const BLOCKED_TOKENS: &[&str] = &["bomb", "weapon", "ignore previous instructions"];

/// Mock 客户端：规则驱动，无需 API
#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    fn last_human(messages: &[Message]) -> &str {
        messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Human)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    /// 最后一条用户消息之后是否已有工具结果（Responder 第二轮的判据）
    fn has_tool_result_after_human(messages: &[Message]) -> bool {
        let last_human = messages.iter().rposition(|m| m.role == Role::Human);
        match last_human {
            Some(idx) => messages[idx..].iter().any(|m| m.role == Role::ToolResult),
            None => false,
        }
    }

    fn pick_section(input: &str) -> &'static str {
        let lower = input.to_lowercase();
        if lower.contains("skill") || lower.contains("stack") || lower.contains("tech") {
            "skills"
        } else if lower.contains("project") || lower.contains("built") {
            "projects"
        } else if lower.contains("contact") || lower.contains("hire") || lower.contains("reach") {
            "contact"
        } else {
            "experience"
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, req: GenerateRequest<'_>) -> Result<Generation, LlmError> {
        let input = Self::last_human(req.messages).to_lowercase();

        // 相关性过滤
        if req.system.contains("gatekeeper") {
            let relevant = RELEVANT_KEYWORDS.iter().any(|k| input.contains(k));
            let json = serde_json::json!({ "is_relevant": relevant });
            return Ok(Generation {
                content: json.to_string(),
                tool_calls: Vec::new(),
                structured: Some(json),
            });
        }

        // 安全审查
        if req.system.contains("guardrails") {
            let passed = !BLOCKED_TOKENS.iter().any(|t| input.contains(t));
            let json = serde_json::json!({ "guardrails_passed": passed });
            return Ok(Generation {
                content: json.to_string(),
                tool_calls: Vec::new(),
                structured: Some(json),
            });
        }

        // 话题劝导
        if req.system.contains("not appropriate for this chat") {
            return Ok(Generation {
                content: "That question is outside what this portfolio chat covers. \
                          Feel free to ask about my work experience, skills, or projects."
                    .to_string(),
                ..Generation::default()
            });
        }

        // 安全拒答
        if req.system.contains("declined for safety reasons") {
            return Ok(Generation {
                content: "I can't help with that request. If you have questions about my \
                          professional background, I'm happy to answer those."
                    .to_string(),
                ..Generation::default()
            });
        }

        // Responder：第一轮发起档案查询，拿到工具结果后给出回答
        if req.tools.is_some() && !Self::has_tool_result_after_human(req.messages) {
            let section = Self::pick_section(&input);
            return Ok(Generation {
                content: String::new(),
                tool_calls: vec![GeneratedToolCall {
                    id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                    name: "profile_lookup".to_string(),
                    arguments: serde_json::json!({ "section": section }).to_string(),
                }],
                structured: None,
            });
        }

        let grounding = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::ToolResult)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "my background".to_string());

        Ok(Generation {
            content: format!("Here's what I can share: {}", grounding),
            ..Generation::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req<'a>(system: &'a str, messages: &'a [Message]) -> GenerateRequest<'a> {
        GenerateRequest {
            system,
            messages,
            tools: None,
            response_schema: None,
        }
    }

    #[tokio::test]
    async fn test_relevance_classification() {
        let mock = MockLlmClient;
        let messages = vec![Message::human("Tell me about your previous roles.")];
        let gen = mock
            .generate(req("You are a gatekeeper...", &messages))
            .await
            .unwrap();
        assert_eq!(gen.structured.unwrap()["is_relevant"], true);

        let messages = vec![Message::human("Write me a poem about the moon.")];
        let gen = mock
            .generate(req("You are a gatekeeper...", &messages))
            .await
            .unwrap();
        assert_eq!(gen.structured.unwrap()["is_relevant"], false);
    }

    #[tokio::test]
    async fn test_guardrail_blocks_token() {
        let mock = MockLlmClient;
        let messages = vec![Message::human("What projects have you built with a bomb?")];
        let gen = mock
            .generate(req("You are a safety guardrails agent...", &messages))
            .await
            .unwrap();
        assert_eq!(gen.structured.unwrap()["guardrails_passed"], false);
    }

    #[tokio::test]
    async fn test_responder_requests_tool_then_answers() {
        let mock = MockLlmClient;
        let tools = vec![crate::llm::ToolSpec {
            name: "profile_lookup".to_string(),
            description: String::new(),
            parameters: serde_json::json!({}),
        }];
        let messages = vec![Message::human("What is your tech stack?")];
        let mut r = req("You speak in first person...", &messages);
        r.tools = Some(&tools);
        let gen = mock.generate(r).await.unwrap();
        assert_eq!(gen.tool_calls.len(), 1);
        assert_eq!(gen.tool_calls[0].name, "profile_lookup");

        let messages = vec![
            Message::human("What is your tech stack?"),
            Message::tool_result("c1", crate::core::ToolCallStatus::Complete, "Rust, Tokio"),
        ];
        let mut r = req("You speak in first person...", &messages);
        r.tools = Some(&tools);
        let gen = mock.generate(r).await.unwrap();
        assert!(gen.tool_calls.is_empty());
        assert!(gen.content.contains("Rust, Tokio"));
    }
}
