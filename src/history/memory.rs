//! 内存版历史存储

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{HistoryEntry, HistoryError, HistoryStore};
use crate::research::ResearchResponse;

#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    entries: RwLock<HashMap<String, Vec<HistoryEntry>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(
        &self,
        user_id: &str,
        query: &str,
        results: &ResearchResponse,
    ) -> Result<HistoryEntry, HistoryError> {
        let entry = HistoryEntry::new(query, results);
        self.entries
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(entry)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<HistoryEntry>, HistoryError> {
        let entries = self.entries.read().await;
        // 先反转再稳定排序：同一毫秒内后追加的排在前面
        let mut list: Vec<HistoryEntry> = entries
            .get(user_id)
            .map(|v| v.iter().rev().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(list)
    }

    async fn clear(&self, user_id: &str) -> Result<bool, HistoryError> {
        let removed = self.entries.write().await.remove(user_id);
        Ok(removed.is_some_and(|v| !v.is_empty()))
    }
}
