//! 流重建：把消息日志确定性折叠为展示块
//!
//! 折叠是纯函数且幂等：对同一（可能追加变长的）日志重跑，已有块绝不重排，
//! 只会追加新块或原地更新工具状态。tool_result 按 id 在全部先前 agent 块中
//! 回溯匹配（显式 pending 集，而非顺序向前看），乱序与部分送达下仍正确；
//! 无主结果作为孤儿块可见保留，便于排查。

use std::collections::HashMap;

use crate::core::{Message, Role, ToolCallStatus};

/// 展示用工具卡片
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallView {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
    pub result: Option<String>,
}

/// 展示块：由消息日志派生，绝不持久化
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayBlock {
    User {
        id: String,
        content: String,
    },
    Agent {
        id: String,
        content: String,
        tool_calls: Vec<ToolCallView>,
        streaming: bool,
    },
}

impl DisplayBlock {
    pub fn id(&self) -> &str {
        match self {
            DisplayBlock::User { id, .. } | DisplayBlock::Agent { id, .. } => id,
        }
    }
}

/// 折叠消息日志为展示块；streaming_id 为正在流式接收的消息 id
pub fn group_messages(messages: &[Message], streaming_id: Option<&str>) -> Vec<DisplayBlock> {
    let mut blocks: Vec<DisplayBlock> = Vec::new();
    // 已声明、尚未被结果消费的调用：call_id -> (块下标, 卡片下标)
    let mut pending: HashMap<String, (usize, usize)> = HashMap::new();

    for msg in messages {
        match msg.role {
            Role::Human => blocks.push(DisplayBlock::User {
                id: msg.id.clone(),
                content: msg.content.clone(),
            }),
            Role::Assistant => {
                let block_idx = blocks.len();
                let views: Vec<ToolCallView> = msg
                    .tool_calls
                    .iter()
                    .enumerate()
                    .map(|(call_idx, tc)| {
                        pending.insert(tc.id.clone(), (block_idx, call_idx));
                        ToolCallView {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                            status: tc.status,
                            result: tc.result.clone(),
                        }
                    })
                    .collect();
                blocks.push(DisplayBlock::Agent {
                    id: msg.id.clone(),
                    content: msg.content.clone(),
                    tool_calls: views,
                    streaming: streaming_id == Some(msg.id.as_str()),
                });
            }
            Role::ToolResult => {
                let call_id = msg.tool_call_id.clone().unwrap_or_default();
                let status = msg.tool_status.unwrap_or(ToolCallStatus::Complete);
                // 每个 id 至多消费一次；重复结果与无主结果都落到孤儿分支
                match pending.remove(&call_id) {
                    Some((block_idx, call_idx)) => {
                        if let DisplayBlock::Agent { tool_calls, .. } = &mut blocks[block_idx] {
                            tool_calls[call_idx].status = status;
                            tool_calls[call_idx].result = Some(msg.content.clone());
                        }
                    }
                    None => blocks.push(DisplayBlock::Agent {
                        id: msg.id.clone(),
                        content: String::new(),
                        tool_calls: vec![ToolCallView {
                            id: call_id,
                            name: "(orphaned result)".to_string(),
                            arguments: serde_json::Value::Null,
                            status,
                            result: Some(msg.content.clone()),
                        }],
                        streaming: false,
                    }),
                }
            }
        }
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolCall;

    fn assistant_with_call(call_id: &str) -> Message {
        let mut m = Message::assistant("");
        m.tool_calls.push(ToolCall::pending(
            call_id,
            "profile_lookup",
            serde_json::json!({"section": "skills"}),
        ));
        m
    }

    #[test]
    fn test_basic_grouping() {
        let log = vec![
            Message::human("What is your tech stack?"),
            Message::assistant("Rust, mostly."),
        ];
        let blocks = group_messages(&log, None);
        assert_eq!(blocks.len(), 2);
        assert!(matches!(blocks[0], DisplayBlock::User { .. }));
        assert!(matches!(blocks[1], DisplayBlock::Agent { .. }));
    }

    #[test]
    fn test_result_matches_earlier_block() {
        let log = vec![
            Message::human("skills?"),
            assistant_with_call("c1"),
            Message::human("still there?"),
            Message::tool_result("c1", ToolCallStatus::Complete, "Rust, Tokio"),
        ];
        let blocks = group_messages(&log, None);
        // 结果回溯写入第二个块，不产生新块
        assert_eq!(blocks.len(), 3);
        let DisplayBlock::Agent { tool_calls, .. } = &blocks[1] else {
            panic!("Expected agent block");
        };
        assert!(matches!(tool_calls[0].status, ToolCallStatus::Complete));
        assert_eq!(tool_calls[0].result.as_deref(), Some("Rust, Tokio"));
    }

    #[test]
    fn test_unresolved_call_stays_pending() {
        let log = vec![Message::human("q"), assistant_with_call("c1")];
        let blocks = group_messages(&log, None);
        let DisplayBlock::Agent { tool_calls, .. } = &blocks[1] else {
            panic!("Expected agent block");
        };
        assert!(matches!(tool_calls[0].status, ToolCallStatus::Pending));
    }

    #[test]
    fn test_orphaned_result_is_visible() {
        let log = vec![
            Message::human("q"),
            Message::tool_result("c_unknown", ToolCallStatus::Error, "lost"),
        ];
        let blocks = group_messages(&log, None);
        assert_eq!(blocks.len(), 2);
        let DisplayBlock::Agent { tool_calls, .. } = &blocks[1] else {
            panic!("Expected orphan agent block");
        };
        assert_eq!(tool_calls[0].name, "(orphaned result)");
        assert!(matches!(tool_calls[0].status, ToolCallStatus::Error));
    }

    #[test]
    fn test_duplicate_result_becomes_orphan() {
        let log = vec![
            Message::human("q"),
            assistant_with_call("c1"),
            Message::tool_result("c1", ToolCallStatus::Complete, "first"),
            Message::tool_result("c1", ToolCallStatus::Complete, "second"),
        ];
        let blocks = group_messages(&log, None);
        // 第一次结果就地消费，第二次成为孤儿块
        assert_eq!(blocks.len(), 3);
    }

    /// 幂等：日志追加后重折，共有前缀的块 id 与顺序不变
    #[test]
    fn test_fold_is_idempotent_over_appends() {
        let mut log = vec![
            Message::human("skills?"),
            assistant_with_call("c1"),
        ];
        let before = group_messages(&log, None);

        log.push(Message::tool_result("c1", ToolCallStatus::Complete, "Rust"));
        log.push(Message::assistant("Here you go"));
        let after = group_messages(&log, None);

        assert_eq!(group_messages(&log, None), after);
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.id(), b.id());
        }
        assert!(after.len() >= before.len());
    }

    #[test]
    fn test_unparsed_arguments_kept_as_text() {
        let mut m = Message::assistant("");
        m.tool_calls.push(ToolCall::pending(
            "c1",
            "profile_lookup",
            serde_json::Value::String(r#"{"secti"#.to_string()),
        ));
        let log = vec![Message::human("q"), m];
        let blocks = group_messages(&log, None);
        let DisplayBlock::Agent { tool_calls, .. } = &blocks[1] else {
            panic!("Expected agent block");
        };
        assert!(tool_calls[0].arguments.is_string());
    }
}
