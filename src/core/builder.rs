//! 研究服务构建器：CLI 与 HTTP 入口共享同一套装配逻辑
//!
//! 默认按配置创建 OpenAI 兼容客户端、Serper 搜索网关与历史存储；测试可逐项替换。

use std::sync::Arc;

use crate::config::{AppConfig, HistoryBackend};
use crate::core::{ResearchError, RunSupervisor};
use crate::history::{HistoryStore, InMemoryHistoryStore, SqliteHistoryStore};
use crate::llm::{GatewayConfig, LlmClient, ModelGateway, OpenAiClient, Throttle};
use crate::progress::ProgressHub;
use crate::research::{PipelineOptions, ResearchPipeline};
use crate::search::{SearchGateway, SerperClient, WebSearch};

pub struct ResearcherBuilder {
    config: AppConfig,
    llm_client: Option<Arc<dyn LlmClient>>,
    search: Option<Arc<dyn WebSearch>>,
    history: Option<Arc<dyn HistoryStore>>,
    throttle: Option<Arc<Throttle>>,
}

impl ResearcherBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm_client: None,
            search: None,
            history: None,
            throttle: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 替换模型客户端（默认：OpenAI 兼容 HTTP 客户端）
    pub fn with_llm_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.llm_client = Some(client);
        self
    }

    /// 替换搜索实现；传入的实现原样交给流水线，不再包装为不失败的网关
    pub fn with_search(mut self, search: Arc<dyn WebSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// 共享节流器（多个网关共用同一节奏）
    pub fn with_throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn build_gateway(&self) -> Result<ModelGateway, ResearchError> {
        let cfg = &self.config.llm;
        let client: Arc<dyn LlmClient> = match &self.llm_client {
            Some(client) => Arc::clone(client),
            None => Arc::new(OpenAiClient::from_config(cfg)?),
        };
        let throttle = self
            .throttle
            .clone()
            .unwrap_or_else(|| Arc::new(Throttle::new(cfg.rate_limit_delay())));
        Ok(ModelGateway::new(client, throttle, GatewayConfig::from_section(cfg)))
    }

    pub fn build_search(&self) -> Result<Arc<dyn WebSearch>, ResearchError> {
        match &self.search {
            Some(search) => Ok(Arc::clone(search)),
            None => {
                let serper = SerperClient::from_config(&self.config.search)?;
                Ok(Arc::new(
                    SearchGateway::new(Arc::new(serper)).with_limit(self.config.search.max_results),
                ))
            }
        }
    }

    pub fn build_history(&self) -> Result<Arc<dyn HistoryStore>, ResearchError> {
        if let Some(history) = &self.history {
            return Ok(Arc::clone(history));
        }
        let cfg = &self.config.history;
        Ok(match cfg.backend {
            HistoryBackend::Memory => Arc::new(InMemoryHistoryStore::new()),
            HistoryBackend::Sqlite => {
                tracing::info!(path = %cfg.sqlite_path.display(), "opening sqlite history store");
                Arc::new(SqliteHistoryStore::open(&cfg.sqlite_path)?)
            }
        })
    }

    pub fn build_pipeline(&self) -> Result<ResearchPipeline, ResearchError> {
        Ok(ResearchPipeline::new(
            Arc::new(self.build_gateway()?),
            self.build_search()?,
            PipelineOptions::from_section(&self.config.pipeline),
        ))
    }

    pub fn build(self) -> Result<RunSupervisor, ResearchError> {
        let pipeline = self.build_pipeline()?;
        let history = self.build_history()?;
        Ok(RunSupervisor::new(
            Arc::new(pipeline),
            Arc::new(ProgressHub::new()),
            history,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_build_with_injected_parts() {
        let mut config = AppConfig::default();
        config.llm.default_model = "gemma2-9b-it".to_string();

        let supervisor = ResearcherBuilder::new(config)
            .with_llm_client(Arc::new(MockLlmClient::new("ok")))
            .with_search(Arc::new(SearchGateway::new(Arc::new(
                SerperClient::new("http://127.0.0.1:9", "key", std::time::Duration::from_secs(1))
                    .unwrap(),
            ))))
            .build()
            .unwrap();
        assert_eq!(supervisor.gateway().default_model(), "gemma2-9b-it");
    }

    #[test]
    fn test_shared_throttle_is_used() {
        let throttle = Arc::new(Throttle::new(std::time::Duration::from_millis(42)));
        let gateway = ResearcherBuilder::new(AppConfig::default())
            .with_llm_client(Arc::new(MockLlmClient::new("ok")))
            .with_throttle(Arc::clone(&throttle))
            .build_gateway()
            .unwrap();
        assert!(Arc::ptr_eq(gateway.throttle(), &throttle));
    }

    #[test]
    fn test_sqlite_backend_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.history.backend = HistoryBackend::Sqlite;
        config.history.sqlite_path = dir.path().join("history.db");

        let builder = ResearcherBuilder::new(config);
        assert!(builder.build_history().is_ok());
        assert!(dir.path().join("history.db").exists());
    }
}
