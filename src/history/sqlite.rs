//! SQLite 历史存储（rusqlite，同步连接放在 spawn_blocking 中执行）
//!
//! 表 research_history：每行一条 HistoryEntry，results 以 JSON 文本存储，无 schema 版本与迁移。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};

use super::{HistoryEntry, HistoryError, HistoryStore};
use crate::research::ResearchResponse;

pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| HistoryError::Storage(e.to_string()))?;
            }
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, HistoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS research_history (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                query TEXT NOT NULL,
                results TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_user ON research_history(user_id, timestamp);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, HistoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, HistoryError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| HistoryError::Storage("connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| HistoryError::Storage(e.to_string()))?
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(
        &self,
        user_id: &str,
        query: &str,
        results: &ResearchResponse,
    ) -> Result<HistoryEntry, HistoryError> {
        let entry = HistoryEntry::new(query, results);
        let results_json = serde_json::to_string(&entry.results)?;
        let user_id = user_id.to_string();
        let row = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO research_history (id, user_id, timestamp, query, results)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![row.id, user_id, row.timestamp, row.query, results_json],
            )?;
            Ok(())
        })
        .await?;
        Ok(entry)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<HistoryEntry>, HistoryError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, query, results FROM research_history
                 WHERE user_id = ?1 ORDER BY timestamp DESC, rowid DESC",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (id, timestamp, query, results) = row?;
                entries.push(HistoryEntry {
                    id,
                    timestamp,
                    query,
                    results: serde_json::from_str(&results)?,
                });
            }
            Ok(entries)
        })
        .await
    }

    async fn clear(&self, user_id: &str) -> Result<bool, HistoryError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM research_history WHERE user_id = ?1",
                params![user_id],
            )?;
            Ok(deleted > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::{RunState, Stage};
    use crate::search::SearchResult;

    fn response(query: &str) -> ResearchResponse {
        let mut state = RunState::new(query, Some("gemma2-9b-it"));
        state.status = Stage::Completed;
        state.search_queries = vec![query.to_string()];
        state.search_results = vec![SearchResult {
            title: "t".to_string(),
            link: "https://example.com".to_string(),
            snippet: "s".to_string(),
            source: "google".to_string(),
        }];
        state.final_research = "final".to_string();
        ResearchResponse::from_state(&state)
    }

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");

        {
            let store = SqliteHistoryStore::open(&path).unwrap();
            store.append("u1", "first", &response("first")).await.unwrap();
            store.append("u1", "second", &response("second")).await.unwrap();
        }

        let reopened = SqliteHistoryStore::open(&path).unwrap();
        let list = reopened.list("u1").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].query, "second");
        assert_eq!(list[1].results, response("first"));
    }

    #[tokio::test]
    async fn test_clear_only_touches_one_user() {
        let store = SqliteHistoryStore::in_memory().unwrap();
        store.append("u1", "a", &response("a")).await.unwrap();
        store.append("u2", "b", &response("b")).await.unwrap();

        assert!(store.clear("u1").await.unwrap());
        assert!(!store.clear("u1").await.unwrap());
        assert!(store.list("u1").await.unwrap().is_empty());
        assert_eq!(store.list("u2").await.unwrap().len(), 1);
    }
}
