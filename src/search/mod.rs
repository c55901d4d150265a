//! 网页搜索：结果记录、搜索 trait、Serper 客户端与不失败的搜索网关
//!
//! - [`WebSearch`]：一次搜索调用，可能失败（流水线测试可注入失败的实现）
//! - [`SerperClient`]：Serper（Google）HTTP 实现
//! - [`SearchGateway`]：包装任意 WebSearch，失败只记日志并返回空列表

pub mod gateway;
pub mod serper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use gateway::SearchGateway;
pub use serper::SerperClient;

/// 单条搜索结果；字段可能为空字符串，source 标识搜索提供方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub link: String,
    pub snippet: String,
    pub source: String,
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request failed: {0}")]
    Network(String),

    #[error("failed to decode search response: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),
}

/// 搜索 trait：返回至多 max_results 条，按提供方给出的顺序
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize)
        -> Result<Vec<SearchResult>, SearchError>;
}
