//! 搜索网关：任何失败都只记日志并返回空列表，调用方永远拿到 Ok

use std::sync::Arc;

use async_trait::async_trait;

use super::{SearchError, SearchResult, WebSearch};

pub struct SearchGateway {
    inner: Arc<dyn WebSearch>,
    /// 单次搜索返回条数的上限（[search].max_results）
    limit: Option<usize>,
}

impl SearchGateway {
    pub fn new(inner: Arc<dyn WebSearch>) -> Self {
        Self { inner, limit: None }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
impl WebSearch for SearchGateway {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let max_results = self.limit.map_or(max_results, |l| l.min(max_results));
        match self.inner.search(query, max_results).await {
            Ok(mut results) => {
                results.truncate(max_results);
                Ok(results)
            }
            Err(e) => {
                tracing::warn!(query, error = %e, "web search failed, returning no results");
                Ok(Vec::new())
            }
        }
    }
}
