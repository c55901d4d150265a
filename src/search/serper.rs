//! Serper 搜索客户端：POST {base_url}/search，取 organic 结果
//!
//! 请求体 `{"q": query, "num": n}`，鉴权头 `X-API-KEY`；非 2xx 视为失败。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{SearchError, SearchResult, WebSearch};
use crate::config::SearchSection;

/// 结果中的 source 标签
pub const SERPER_SOURCE: &str = "google";

pub struct SerperClient {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct SerperRequest<'a> {
    q: &'a str,
    num: usize,
}

#[derive(Deserialize, Default)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<OrganicResult>,
}

#[derive(Deserialize, Default)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
}

impl SerperClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, SearchError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = HeaderValue::from_str(api_key)
            .map_err(|_| SearchError::Config("invalid API key format".to_string()))?;
        headers.insert("X-API-KEY", key);

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| SearchError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// 从 [search] 配置创建；缺少 API Key 时返回 Config 错误
    pub fn from_config(cfg: &SearchSection) -> Result<Self, SearchError> {
        let api_key = cfg
            .resolved_api_key()
            .ok_or_else(|| SearchError::Config("SERPER_API_KEY not set".to_string()))?;
        Self::new(&cfg.base_url, &api_key, Duration::from_secs(cfg.timeout_secs))
    }
}

/// 把 organic 结果归一化为 SearchResult，保持顺序并截断到 max_results
fn normalize(response: SerperResponse, max_results: usize) -> Vec<SearchResult> {
    response
        .organic
        .into_iter()
        .take(max_results)
        .map(|r| SearchResult {
            title: r.title,
            link: r.link,
            snippet: r.snippet,
            source: SERPER_SOURCE.to_string(),
        })
        .collect()
}

#[async_trait]
impl WebSearch for SerperClient {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let resp = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&SerperRequest {
                q: query,
                num: max_results,
            })
            .send()
            .await
            .map_err(|e| SearchError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SearchError::Http {
                status: status.as_u16(),
                message: body.chars().take(300).collect(),
            });
        }

        let body: SerperResponse = resp
            .json()
            .await
            .map_err(|e| SearchError::Decode(e.to_string()))?;
        Ok(normalize(body, max_results))
    }
}
