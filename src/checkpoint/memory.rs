//! 内存检查点存储（进程内；重启即失）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::{CheckpointError, ConversationState};

use super::{summary_title, CheckpointStore, ThreadSummary};

/// 内存存储：RwLock<HashMap>，写锁天然串行同一 thread 的保存
#[derive(Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<String, ConversationState>>,
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>, CheckpointError> {
        Ok(self.threads.read().await.get(thread_id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<(), CheckpointError> {
        self.threads
            .write()
            .await
            .insert(state.thread_id.clone(), state.clone());
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<ThreadSummary>, CheckpointError> {
        let threads = self.threads.read().await;
        let mut items: Vec<ThreadSummary> = threads
            .values()
            .map(|s| ThreadSummary {
                thread_id: s.thread_id.clone(),
                created_at: s.created_at.clone(),
                message_count: s.messages.len(),
                title: summary_title(s),
            })
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::new_thread_id;

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryCheckpointStore::default();
        let mut state = ConversationState::new(new_thread_id());
        state.begin_turn("hello");

        store.save(&state).await.unwrap();
        let loaded = store.load(&state.thread_id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_load_absent_is_none() {
        let store = MemoryCheckpointStore::default();
        assert!(store.load("thread_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_titles_and_limit() {
        let store = MemoryCheckpointStore::default();
        for i in 0..3 {
            let mut state = ConversationState::new(format!("thread_{}", i));
            state.begin_turn(format!("question {}", i));
            store.save(&state).await.unwrap();
        }
        let items = store.list(2).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].title.starts_with("question"));
    }
}
