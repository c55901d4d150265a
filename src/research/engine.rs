//! 流水线引擎：按 status 路由执行阶段，合并阶段输出，遇错立即终止
//!
//! 阶段内的 `Err` 与 panic 都在阶段边界被截获，转换为带阶段前缀的 error 文本、
//! 一条 percent=0 的 error 进度事件，以及 `{error, status: error}`。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::Instrument;

use crate::config::PipelineSection;
use crate::core::ResearchError;
use crate::llm::ModelGateway;
use crate::progress::ProgressSink;
use crate::search::WebSearch;

use super::stages::{self, StageContext};
use super::state::{route, ResearchResponse, Route, RunState, Stage, StateUpdate};

/// 流水线选项
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// 每条规划查询请求的搜索结果数
    pub max_results_per_query: usize,
    /// 阶段收到网关失败文本时是否按阶段错误处理
    pub treat_failure_text_as_error: bool,
}

impl PipelineOptions {
    pub fn from_section(cfg: &PipelineSection) -> Self {
        Self {
            max_results_per_query: cfg.max_results_per_query,
            treat_failure_text_as_error: cfg.treat_failure_text_as_error,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_section(&PipelineSection::default())
    }
}

/// 研究流水线：无运行期可变状态，可被多个并发 run 共享
pub struct ResearchPipeline {
    gateway: Arc<ModelGateway>,
    search: Arc<dyn WebSearch>,
    options: PipelineOptions,
}

impl ResearchPipeline {
    pub fn new(gateway: Arc<ModelGateway>, search: Arc<dyn WebSearch>, options: PipelineOptions) -> Self {
        Self {
            gateway,
            search,
            options,
        }
    }

    pub fn gateway(&self) -> &Arc<ModelGateway> {
        &self.gateway
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// 执行一次研究并返回响应（成功与失败同一形状）
    pub async fn run(&self, query: &str, model: Option<&str>, sink: &dyn ProgressSink) -> ResearchResponse {
        let state = self.run_state(query, model, sink).await;
        ResearchResponse::from_state(&state)
    }

    /// 执行一次研究并返回最终 RunState
    pub async fn run_state(&self, query: &str, model: Option<&str>, sink: &dyn ProgressSink) -> RunState {
        let mut state = RunState::new(query, model);
        let ctx = StageContext::new(&self.gateway, self.search.as_ref(), &self.options, sink);
        tracing::info!(query, model = self.gateway.resolve_model(model), "research started");

        while let Route::Run(stage) = route(&state) {
            let span = tracing::info_span!("stage", stage = %stage);
            let outcome = AssertUnwindSafe(stages::run_stage(stage, &ctx, &state).instrument(span))
                .catch_unwind()
                .await;

            let update = match outcome {
                Ok(Ok(update)) => update,
                Ok(Err(e)) => fail_stage(&ctx, &state, stage, e.to_string()),
                Err(panic) => fail_stage(&ctx, &state, stage, panic_message(panic.as_ref())),
            };
            state.apply(update);
            state.progress = ctx.last_event();

            let expected = stage.next(state.has_error());
            if state.status != expected {
                let detail = format!("stage ended in {} instead of {}", state.status, expected);
                let update = fail_stage(&ctx, &state, stage, detail);
                state.apply(update);
                state.progress = ctx.last_event();
            }
        }

        match state.error.as_deref() {
            Some(error) => tracing::warn!(query, error, "research failed"),
            None => tracing::info!(
                query,
                results = state.search_results.len(),
                "research completed"
            ),
        }
        state
    }
}

fn fail_stage(ctx: &StageContext<'_>, state: &RunState, stage: Stage, detail: String) -> StateUpdate {
    let message = format!("{}{}", stages::error_prefix(stage), detail);
    let err = ResearchError::Stage {
        stage,
        message: message.clone(),
    };
    tracing::warn!(error = %err, "stage failed");
    ctx.report(state, Stage::Error, message.clone(), 0.0);
    StateUpdate::failed(message)
}

/// 取出 panic 负载中的文本
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::mock::MockLlmClient;
    use crate::llm::{GatewayConfig, Throttle};
    use crate::progress::CollectingSink;
    use crate::search::{SearchError, SearchResult};

    struct Empty;

    #[async_trait]
    impl WebSearch for Empty {
        async fn search(&self, _: &str, _: usize) -> Result<Vec<SearchResult>, SearchError> {
            Ok(Vec::new())
        }
    }

    struct Panicking;

    #[async_trait]
    impl WebSearch for Panicking {
        async fn search(&self, _: &str, _: usize) -> Result<Vec<SearchResult>, SearchError> {
            panic!("search backend exploded");
        }
    }

    fn pipeline(reply: &str, search: Arc<dyn WebSearch>) -> (Arc<MockLlmClient>, ResearchPipeline) {
        let mock = Arc::new(MockLlmClient::new(reply));
        let gateway = ModelGateway::new(
            mock.clone(),
            Arc::new(Throttle::new(Duration::ZERO)),
            GatewayConfig::default(),
        );
        let pipeline = ResearchPipeline::new(Arc::new(gateway), search, PipelineOptions::default());
        (mock, pipeline)
    }

    #[tokio::test]
    async fn test_unparseable_plan_still_completes() {
        let (mock, pipeline) = pipeline("no markers here", Arc::new(Empty));
        let sink = CollectingSink::new();

        let state = pipeline.run_state("steel", None, &sink).await;
        assert_eq!(state.status, Stage::Completed);
        assert_eq!(state.search_queries, vec!["steel"]);
        assert_eq!(state.final_research, "no markers here");
        // plan + synthesize + reflect×2
        assert_eq!(mock.call_count(), 4);
        assert_eq!(state.progress.as_ref().map(|p| p.percent), Some(100.0));
    }

    #[tokio::test]
    async fn test_panic_in_stage_becomes_stage_error() {
        let (mock, pipeline) = pipeline("- Search Query 1: a", Arc::new(Panicking));
        let sink = CollectingSink::new();

        let response = pipeline.run("steel", None, &sink).await;
        assert_eq!(response.status, Stage::Error);
        let error = response.error.unwrap();
        assert!(error.starts_with("Error in executing searches: "));
        assert!(error.contains("search backend exploded"));
        assert_eq!(mock.call_count(), 1);

        let last = sink.events().last().cloned().unwrap();
        assert_eq!(last.step, Stage::Error);
        assert_eq!(last.percent, 0.0);
    }

    #[tokio::test]
    async fn test_stage_order_follows_transition_table() {
        let (_, pipeline) = pipeline("- Search Query 1: a", Arc::new(Empty));
        let sink = CollectingSink::new();
        pipeline.run_state("steel", None, &sink).await;

        let mut steps: Vec<Stage> = sink.events().into_iter().map(|e| e.step).collect();
        steps.dedup();
        assert_eq!(steps.first(), Some(&Stage::Planning));
        for pair in steps.windows(2) {
            assert_eq!(pair[0].next(false), pair[1]);
        }
        assert_eq!(steps.last(), Some(&Stage::Completed));
    }

    #[test]
    fn test_options_follow_config_defaults() {
        let options = PipelineOptions::default();
        assert_eq!(options.max_results_per_query, 5);
        assert!(!options.treat_failure_text_as_error);
    }
}
