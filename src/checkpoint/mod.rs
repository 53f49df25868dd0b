//! 检查点存储抽象层
//!
//! 每次阶段转移后保存会话状态（崩溃最多丢一个在途阶段的产出）；
//! 同一 thread 的写入必须排队串行（禁止 last-writer-wins 竞态），不同 thread 完全并发。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::CheckpointSection;
use crate::core::{CheckpointError, ConversationState, Role};

pub mod file;
pub mod memory;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

/// 线程摘要（历史列表用）
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub created_at: String,
    pub message_count: usize,
    pub title: String,
}

/// 检查点存储接口
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 装载线程状态；不存在返回 None
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>, CheckpointError>;

    /// 保存线程状态；同一 thread 的并发保存被排队串行
    async fn save(&self, state: &ConversationState) -> Result<(), CheckpointError>;

    /// 列出线程摘要，新建在前
    async fn list(&self, limit: usize) -> Result<Vec<ThreadSummary>, CheckpointError>;
}

/// 由首条用户消息生成列表标题（截断到 50 字符）
pub(crate) fn summary_title(state: &ConversationState) -> String {
    state
        .messages
        .iter()
        .find(|m| m.role == Role::Human)
        .map(|m| {
            let t = m.content.trim();
            if t.chars().count() > 50 {
                format!("{}...", t.chars().take(50).collect::<String>())
            } else {
                t.to_string()
            }
        })
        .unwrap_or_else(|| "New conversation".to_string())
}

/// 创建检查点存储
///
/// 配置了 dir 时使用文件存储；目录不可用则告警回退内存存储
pub fn create_checkpoint_store(cfg: &CheckpointSection) -> Arc<dyn CheckpointStore> {
    if let Some(ref dir) = cfg.dir {
        match FileCheckpointStore::new(dir) {
            Ok(store) => {
                tracing::info!("Using file checkpoint store: {:?}", dir);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to create file store, falling back to memory: {}", e);
            }
        }
    }

    tracing::info!("Using in-memory checkpoint store");
    Arc::new(MemoryCheckpointStore::default())
}
