//! 研究历史：按用户/会话 ID 追加、按时间倒序列出、显式清空
//!
//! - [`InMemoryHistoryStore`]：进程内 HashMap（默认）
//! - [`SqliteHistoryStore`]：rusqlite 持久化，可替换内存版而不影响流水线

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::research::ResearchResponse;

pub use memory::InMemoryHistoryStore;
pub use sqlite::SqliteHistoryStore;

/// 单条历史：生成的 ID、毫秒时间戳、原始查询与完整响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: i64,
    pub query: String,
    pub results: ResearchResponse,
}

impl HistoryEntry {
    pub fn new(query: &str, results: &ResearchResponse) -> Self {
        let now = chrono::Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("query_{}_{}", now.timestamp(), &suffix[..8]),
            timestamp: now.timestamp_millis(),
            query: query.to_string(),
            results: results.clone(),
        }
    }
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for HistoryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// 历史存储接口
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(
        &self,
        user_id: &str,
        query: &str,
        results: &ResearchResponse,
    ) -> Result<HistoryEntry, HistoryError>;

    /// 按 timestamp 倒序（最新在前）
    async fn list(&self, user_id: &str) -> Result<Vec<HistoryEntry>, HistoryError>;

    /// 清空该用户历史；有条目被删除时返回 true
    async fn clear(&self, user_id: &str) -> Result<bool, HistoryError>;
}
