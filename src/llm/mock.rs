//! Mock LLM 客户端（用于测试，无需 API）
//!
//! - MockLlmClient：固定回复或按消息计算回复，记录每次调用（模型、消息、开始时间）
//! - ScriptedLlmClient：按顺序回放预设的结果队列，用于重试/限流场景

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::llm::{LlmClient, LlmError, Message, Role};

/// 一次被记录的调用
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub messages: Vec<Message>,
    pub started_at: Instant,
}

impl RecordedCall {
    /// 最后一条 User 消息内容
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

type Responder = Box<dyn Fn(&[Message]) -> Result<String, LlmError> + Send + Sync>;

/// Mock 客户端：默认回固定文本
pub struct MockLlmClient {
    responder: Responder,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockLlmClient {
    pub fn new(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::with_responder(move |_| Ok(reply.clone()))
    }

    pub fn with_responder<F>(f: F) -> Self
    where
        F: Fn(&[Message]) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(f),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, model: &str, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                model: model.to_string(),
                messages: messages.to_vec(),
                started_at: Instant::now(),
            });
        }
        (self.responder)(messages)
    }
}

/// 回放客户端：队列耗尽后返回 InvalidResponse
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<usize>,
}

impl ScriptedLlmClient {
    pub fn new(script: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _model: &str, _messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| Err(LlmError::InvalidResponse("script exhausted".to_string())))
    }
}
