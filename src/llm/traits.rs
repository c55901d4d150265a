//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 HTTP / Mock）实现 LlmClient：一次请求只做一次网络调用，
//! 节流、重试与失败文本化由上层 ModelGateway 负责。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 单次调用的传输层错误；RateLimited 携带的是本次响应的 Retry-After
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("{status} {message}")]
    Http { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("config error: {0}")]
    Config(String),
}

/// LLM 客户端 trait：给定模型与消息列表，返回首条 completion 文本
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, model: &str, messages: &[Message]) -> Result<String, LlmError>;
}
