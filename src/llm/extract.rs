//! 结构化抽取：让模型把自由文本按调用方给出的 JSON Schema 输出为严格 JSON
//!
//! 解析失败不抛错，而是返回携带原始回复的 [`ExtractionFailure`]。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::llm::ModelGateway;

/// 抽取失败：序列化为 `{"error": ..., "raw_text": ...}`
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{error}")]
pub struct ExtractionFailure {
    pub error: String,
    pub raw_text: String,
}

impl ExtractionFailure {
    fn new(raw_text: String) -> Self {
        Self {
            error: "Failed to extract structured information".to_string(),
            raw_text,
        }
    }
}

fn extraction_prompt(schema: &str, text: &str) -> String {
    format!(
        "Extract information from the following text according to this JSON schema:\n\n\
         {schema}\n\n\
         Text:\n{text}\n\n\
         Return only a valid JSON object that follows the schema exactly."
    )
}

/// 去掉模型常加的 ```json 代码块围栏
fn strip_code_fence(reply: &str) -> &str {
    let t = reply.trim();
    match t.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.strip_prefix("json").unwrap_or(rest);
            rest.strip_suffix("```").unwrap_or(rest).trim()
        }
        None => t,
    }
}

/// 按任意 JSON Schema 抽取，返回 JSON 值
pub async fn extract(
    gateway: &ModelGateway,
    text: &str,
    schema: &Value,
    model: Option<&str>,
) -> Result<Value, ExtractionFailure> {
    let schema_str = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    let reply = gateway
        .complete(&extraction_prompt(&schema_str, text), None, model)
        .await;

    match serde_json::from_str::<Value>(strip_code_fence(&reply)) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::debug!(error = %e, "extraction reply is not valid JSON");
            Err(ExtractionFailure::new(reply))
        }
    }
}

/// 按类型 T 的 schemars Schema 抽取并反序列化为 T
pub async fn extract_as<T>(
    gateway: &ModelGateway,
    text: &str,
    model: Option<&str>,
) -> Result<T, ExtractionFailure>
where
    T: JsonSchema + DeserializeOwned,
{
    let schema = serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null);
    let value = extract(gateway, text, &schema, model).await?;
    serde_json::from_value(value.clone())
        .map_err(|_| ExtractionFailure::new(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;

    use crate::llm::mock::MockLlmClient;
    use crate::llm::{GatewayConfig, Throttle};

    fn gateway(mock: Arc<MockLlmClient>) -> ModelGateway {
        ModelGateway::new(
            mock,
            Arc::new(Throttle::new(Duration::ZERO)),
            GatewayConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_extract_valid_json() {
        let mock = Arc::new(MockLlmClient::new(r#"{"company": "Acme", "employees": 12}"#));
        let gw = gateway(mock.clone());
        let schema = json!({"type": "object", "properties": {"company": {"type": "string"}}});

        let value = extract(&gw, "Acme has 12 employees", &schema, None).await.unwrap();
        assert_eq!(value["company"], "Acme");
        assert_eq!(value["employees"], 12);

        let prompt = mock.calls()[0].prompt().to_string();
        assert!(prompt.contains("\"company\""));
        assert!(prompt.contains("Acme has 12 employees"));
    }

    #[tokio::test]
    async fn test_extract_accepts_fenced_json() {
        let mock = Arc::new(MockLlmClient::new("```json\n{\"a\": 1}\n```"));
        let value = extract(&gateway(mock), "t", &json!({}), None).await.unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_extract_malformed_returns_failure_with_raw_text() {
        let mock = Arc::new(MockLlmClient::new("Sure! The company is Acme."));
        let err = extract(&gateway(mock), "t", &json!({}), None).await.unwrap_err();
        assert_eq!(err.error, "Failed to extract structured information");
        assert_eq!(err.raw_text, "Sure! The company is Acme.");

        let ser = serde_json::to_value(&err).unwrap();
        assert_eq!(ser["raw_text"], "Sure! The company is Acme.");
    }

    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    struct Company {
        name: String,
        founded: u32,
    }

    #[tokio::test]
    async fn test_extract_as_typed() {
        let mock = Arc::new(MockLlmClient::new(r#"{"name": "Acme", "founded": 1999}"#));
        let gw = gateway(mock.clone());
        let company: Company = extract_as(&gw, "Acme, founded 1999", None).await.unwrap();
        assert_eq!(
            company,
            Company {
                name: "Acme".to_string(),
                founded: 1999
            }
        );
        assert!(mock.calls()[0].prompt().contains("founded"));
    }

    #[tokio::test]
    async fn test_extract_as_wrong_shape_is_failure() {
        let mock = Arc::new(MockLlmClient::new(r#"{"name": "Acme"}"#));
        let result: Result<Company, _> = extract_as(&gateway(mock), "t", None).await;
        assert!(result.is_err());
    }
}
