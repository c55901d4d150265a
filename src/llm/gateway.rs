//! 模型网关：模型白名单、全局节流、429 重试与失败文本化
//!
//! `complete` 永远返回字符串：传输失败被转为描述性文本（"HTTP Error: ..." / "Request Error: ..." / "Error: ..."），
//! 重试耗尽返回 [`MAX_RETRIES_MESSAGE`]。调用方若关心失败，可用 [`is_failure_text`] 判断。

use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmSection;
use crate::llm::{LlmClient, LlmError, Message, OpenAiClient, Throttle};

/// 连续限流达到最大尝试次数后返回的固定文本
pub const MAX_RETRIES_MESSAGE: &str = "Error: Max retries reached. Please try again later.";

const FAILURE_PREFIXES: &[&str] = &["HTTP Error:", "Request Error:", "Error:"];

/// 判断文本是否为网关编码的失败结果
pub fn is_failure_text(text: &str) -> bool {
    let t = text.trim_start();
    FAILURE_PREFIXES.iter().any(|p| t.starts_with(p))
}

/// 网关策略：白名单、默认模型、重试
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub default_model: String,
    pub available_models: Vec<String>,
    /// 最大尝试次数（含首次），至少为 1
    pub max_retries: u32,
    /// 429 未给出 Retry-After 时的等待时长
    pub retry_delay: Duration,
}

impl GatewayConfig {
    pub fn from_section(cfg: &LlmSection) -> Self {
        Self {
            default_model: cfg.default_model.clone(),
            available_models: cfg.available_models.clone(),
            max_retries: cfg.max_retries,
            retry_delay: cfg.retry_delay(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_section(&LlmSection::default())
    }
}

/// 模型网关：所有阶段共享一个实例（Arc），节流器可额外在多个网关间共享
pub struct ModelGateway {
    client: Arc<dyn LlmClient>,
    throttle: Arc<Throttle>,
    config: GatewayConfig,
}

impl ModelGateway {
    pub fn new(client: Arc<dyn LlmClient>, throttle: Arc<Throttle>, config: GatewayConfig) -> Self {
        Self {
            client,
            throttle,
            config,
        }
    }

    /// 按 [llm] 配置创建 OpenAI 兼容客户端与节流器
    pub fn from_config(cfg: &LlmSection) -> Result<Self, LlmError> {
        let client = OpenAiClient::from_config(cfg)?;
        Ok(Self::new(
            Arc::new(client),
            Arc::new(Throttle::new(cfg.rate_limit_delay())),
            GatewayConfig::from_section(cfg),
        ))
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    pub fn available_models(&self) -> &[String] {
        &self.config.available_models
    }

    pub fn is_available(&self, model: &str) -> bool {
        self.config.available_models.iter().any(|m| m == model)
    }

    /// 未指定或不在白名单的模型一律替换为默认模型
    pub fn resolve_model<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        match requested {
            Some(m) if self.is_available(m) => m,
            _ => &self.config.default_model,
        }
    }

    /// 发送一次补全请求；失败不向上传播，而是编码为返回文本
    pub async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        model: Option<&str>,
    ) -> String {
        let model = self.resolve_model(model);

        let mut messages = Vec::with_capacity(2);
        if let Some(sys) = system_prompt.filter(|s| !s.is_empty()) {
            messages.push(Message::system(sys));
        }
        messages.push(Message::user(prompt));

        let max_attempts = self.config.max_retries.max(1);
        for attempt in 1..=max_attempts {
            self.throttle.acquire().await;

            match self.client.complete(model, &messages).await {
                Ok(text) => return text,
                Err(LlmError::RateLimited { retry_after }) => {
                    if attempt == max_attempts {
                        break;
                    }
                    let wait = retry_after.unwrap_or(self.config.retry_delay);
                    tracing::warn!(
                        model,
                        attempt,
                        max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        "rate limited, waiting before retry"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    tracing::warn!(model, attempt, error = %e, "model request failed");
                    return failure_text(&e);
                }
            }
        }

        tracing::warn!(model, max_attempts, "max retries reached");
        MAX_RETRIES_MESSAGE.to_string()
    }
}

fn failure_text(e: &LlmError) -> String {
    match e {
        LlmError::Http { .. } => format!("HTTP Error: {}", e),
        LlmError::Timeout | LlmError::Network(_) => format!("Request Error: {}", e),
        _ => format!("Error: {}", e),
    }
}
