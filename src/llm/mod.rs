//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）、全局节流、模型网关、结构化抽取

pub mod extract;
pub mod gateway;
pub mod mock;
pub mod openai;
pub mod throttle;
pub mod traits;

pub use extract::{extract, extract_as, ExtractionFailure};
pub use gateway::{is_failure_text, GatewayConfig, ModelGateway, MAX_RETRIES_MESSAGE};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use throttle::Throttle;
pub use traits::{LlmClient, LlmError, Message, Role};
