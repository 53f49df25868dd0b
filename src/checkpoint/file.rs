//! 文件检查点存储：每线程一个 JSON 快照
//!
//! 同一 thread 的写入经各自的异步锁排队（并发保存串行落盘，不竞态覆盖）；
//! 不同 thread 的写入互不阻塞。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::{CheckpointError, ConversationState};

use super::{summary_title, CheckpointStore, ThreadSummary};

/// 文件存储：dir/{thread_id}.json
pub struct FileCheckpointStore {
    dir: PathBuf,
    /// thread_id -> 写锁；保存前必须持有对应锁
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    /// 线程快照路径；id 中的异常字符替换为下划线
    fn thread_path(&self, thread_id: &str) -> PathBuf {
        let safe_id: String = thread_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe_id))
    }

    async fn lock_for(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        Arc::clone(
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>, CheckpointError> {
        let path = self.thread_path(thread_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn save(&self, state: &ConversationState) -> Result<(), CheckpointError> {
        let lock = self.lock_for(&state.thread_id).await;
        let _guard = lock.lock().await;
        let path = self.thread_path(&state.thread_id);
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<ThreadSummary>, CheckpointError> {
        let mut items = Vec::new();
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let Ok(data) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(state) = serde_json::from_str::<ConversationState>(&data) else {
                continue;
            };
            items.push(ThreadSummary {
                thread_id: state.thread_id.clone(),
                created_at: state.created_at.clone(),
                message_count: state.messages.len(),
                title: summary_title(&state),
            });
        }
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit);
        Ok(items)
    }
}
