//! 研究流程错误分类
//!
//! - GatewayTransport：网络 / 超时 / 非 2xx（模型网关在自身边界转为文本，搜索失败经 WebSearch 上抛时归入此类）
//! - RateLimit：重试耗尽
//! - Parse：规划输出或抽取 JSON 无法解析
//! - Stage：阶段内部失败，终止本次研究
//! - Config / History / RunNotFound：装配、存储与查询

use thiserror::Error;

use crate::history::HistoryError;
use crate::llm::LlmError;
use crate::research::Stage;
use crate::search::SearchError;

#[derive(Error, Debug)]
pub enum ResearchError {
    #[error("{0}")]
    GatewayTransport(String),

    #[error("{0}")]
    RateLimit(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("stage {stage} failed: {message}")]
    Stage { stage: Stage, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("history error: {0}")]
    History(#[from] HistoryError),

    #[error("run not found: {0}")]
    RunNotFound(String),
}

impl From<SearchError> for ResearchError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::Config(msg) => Self::Config(msg),
            other => Self::GatewayTransport(other.to_string()),
        }
    }
}

impl From<LlmError> for ResearchError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Config(msg) => Self::Config(msg),
            LlmError::RateLimited { .. } => Self::RateLimit(e.to_string()),
            other => Self::GatewayTransport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_step(e: LlmError) -> Result<(), ResearchError> {
        let failed: Result<(), LlmError> = Err(e);
        failed?;
        Ok(())
    }

    #[test]
    fn test_llm_errors_map_to_categories() {
        assert!(matches!(
            build_step(LlmError::Config("GROQ_API_KEY not set".to_string())),
            Err(ResearchError::Config(msg)) if msg == "GROQ_API_KEY not set"
        ));
        assert!(matches!(
            build_step(LlmError::RateLimited { retry_after: None }),
            Err(ResearchError::RateLimit(_))
        ));
        assert!(matches!(
            build_step(LlmError::Timeout),
            Err(ResearchError::GatewayTransport(_))
        ));
    }

    #[test]
    fn test_search_config_error_stays_config() {
        let err: ResearchError = SearchError::Config("SERPER_API_KEY not set".to_string()).into();
        assert!(matches!(err, ResearchError::Config(_)));
        let err: ResearchError = SearchError::Network("refused".to_string()).into();
        assert!(matches!(err, ResearchError::GatewayTransport(msg) if msg.contains("refused")));
    }
}
