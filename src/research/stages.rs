//! 四个研究阶段：规划 → 搜索 → 综合 → 反思
//!
//! 每个阶段只读取 RunState 中声明的输入字段，返回 [`StateUpdate`]；失败以 `Err` 返回，
//! 由引擎统一转换为 error 进度事件与 `{error, status: error}`。

use std::sync::Mutex;

use crate::core::ResearchError;
use crate::llm::{is_failure_text, ModelGateway, MAX_RETRIES_MESSAGE};
use crate::progress::ProgressSink;
use crate::search::WebSearch;

use super::engine::PipelineOptions;
use super::prompts::{self, RESEARCHER_SYSTEM_PROMPT};
use super::state::{ProgressEvent, RunState, Stage, StateUpdate};

const SEARCH_BAND_START: f32 = 25.0;
const SEARCH_BAND_WIDTH: f32 = 25.0;

/// 阶段失败时 error 文本的前缀
pub fn error_prefix(stage: Stage) -> &'static str {
    match stage {
        Stage::Planning => "Error in planning search: ",
        Stage::Searching => "Error in executing searches: ",
        Stage::Synthesizing => "Error in synthesizing information: ",
        Stage::Reflecting => "Error in reflection: ",
        Stage::Completed | Stage::Error => "Error: ",
    }
}

/// 一次运行内各阶段共享的依赖与进度出口
pub struct StageContext<'a> {
    pub gateway: &'a ModelGateway,
    pub search: &'a dyn WebSearch,
    pub options: &'a PipelineOptions,
    sink: &'a dyn ProgressSink,
    last_event: Mutex<Option<ProgressEvent>>,
}

impl<'a> StageContext<'a> {
    pub fn new(
        gateway: &'a ModelGateway,
        search: &'a dyn WebSearch,
        options: &'a PipelineOptions,
        sink: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            gateway,
            search,
            options,
            sink,
            last_event: Mutex::new(None),
        }
    }

    pub fn report(&self, state: &RunState, step: Stage, message: impl Into<String>, percent: f32) {
        let event = ProgressEvent::new(step, message, percent, state.query());
        tracing::debug!(step = %event.step, percent = event.percent, "{}", event.message);
        self.sink.emit(&event);
        if let Ok(mut last) = self.last_event.lock() {
            *last = Some(event);
        }
    }

    /// 最近一次发出的事件
    pub fn last_event(&self) -> Option<ProgressEvent> {
        self.last_event.lock().ok().and_then(|e| e.clone())
    }

    fn model_label<'s>(&'s self, state: &'s RunState) -> &'s str {
        self.gateway.resolve_model(state.model())
    }

    /// 以研究员系统提示词调用模型；严格模式下把网关失败文本转为错误
    async fn ask(&self, state: &RunState, prompt: &str) -> Result<String, ResearchError> {
        let reply = self
            .gateway
            .complete(prompt, Some(RESEARCHER_SYSTEM_PROMPT), state.model())
            .await;

        if self.options.treat_failure_text_as_error && is_failure_text(&reply) {
            return Err(if reply == MAX_RETRIES_MESSAGE {
                ResearchError::RateLimit(reply)
            } else {
                ResearchError::GatewayTransport(reply)
            });
        }
        Ok(reply)
    }
}

/// 按阶段分派
pub async fn run_stage(
    stage: Stage,
    ctx: &StageContext<'_>,
    state: &RunState,
) -> Result<StateUpdate, ResearchError> {
    match stage {
        Stage::Planning => plan(ctx, state).await,
        Stage::Searching => search(ctx, state).await,
        Stage::Synthesizing => synthesize(ctx, state).await,
        Stage::Reflecting => reflect(ctx, state).await,
        Stage::Completed | Stage::Error => Err(ResearchError::Stage {
            stage,
            message: "terminal stage cannot be executed".to_string(),
        }),
    }
}

pub async fn plan(ctx: &StageContext<'_>, state: &RunState) -> Result<StateUpdate, ResearchError> {
    ctx.report(state, Stage::Planning, "Planning search queries...", 10.0);

    let prompt = prompts::planning_prompt(state.query());
    ctx.report(
        state,
        Stage::Planning,
        format!("Generating optimal search queries using {}...", ctx.model_label(state)),
        15.0,
    );

    let response = ctx.ask(state, &prompt).await?;
    let queries = prompts::parse_search_queries(&response, state.query());
    tracing::info!(count = queries.len(), "search queries planned");

    ctx.report(
        state,
        Stage::Planning,
        format!("Generated {} search queries", queries.len()),
        20.0,
    );

    Ok(StateUpdate {
        search_queries: Some(queries),
        status: Some(Stage::Planning.next(false)),
        ..StateUpdate::default()
    })
}

pub async fn search(ctx: &StageContext<'_>, state: &RunState) -> Result<StateUpdate, ResearchError> {
    let queries = &state.search_queries;
    let total = queries.len();
    ctx.report(
        state,
        Stage::Searching,
        format!("Starting web searches with {total} queries..."),
        SEARCH_BAND_START,
    );

    let mut all_results = Vec::new();
    for (i, query) in queries.iter().enumerate() {
        let before = SEARCH_BAND_START + i as f32 / total as f32 * SEARCH_BAND_WIDTH;
        let after = SEARCH_BAND_START + (i + 1) as f32 / total as f32 * SEARCH_BAND_WIDTH;

        ctx.report(
            state,
            Stage::Searching,
            format!("Searching the web [{}/{}]: '{}'", i + 1, total, query),
            before,
        );

        let results = ctx
            .search
            .search(query, ctx.options.max_results_per_query)
            .await?;
        let found = results.len();
        all_results.extend(results);

        ctx.report(
            state,
            Stage::Searching,
            format!("Found {} results for query {}", found, i + 1),
            after,
        );
    }

    ctx.report(
        state,
        Stage::Searching,
        format!("Web search complete. Found {} total results", all_results.len()),
        50.0,
    );

    Ok(StateUpdate {
        search_results: Some(all_results),
        status: Some(Stage::Searching.next(false)),
        ..StateUpdate::default()
    })
}

pub async fn synthesize(
    ctx: &StageContext<'_>,
    state: &RunState,
) -> Result<StateUpdate, ResearchError> {
    ctx.report(state, Stage::Synthesizing, "Analyzing search results...", 55.0);
    ctx.report(
        state,
        Stage::Synthesizing,
        format!("Processing {} search results...", state.search_results.len()),
        60.0,
    );

    let rendered = prompts::render_search_results(&state.search_results);
    ctx.report(
        state,
        Stage::Synthesizing,
        format!("Synthesizing information using {}...", ctx.model_label(state)),
        65.0,
    );

    let prompt = prompts::synthesis_prompt(state.query(), &rendered);
    ctx.report(state, Stage::Synthesizing, "Generating initial research draft...", 70.0);

    let draft = ctx.ask(state, &prompt).await?;
    ctx.report(state, Stage::Synthesizing, "Draft research complete", 75.0);

    Ok(StateUpdate {
        draft_research: Some(draft),
        status: Some(Stage::Synthesizing.next(false)),
        ..StateUpdate::default()
    })
}

pub async fn reflect(ctx: &StageContext<'_>, state: &RunState) -> Result<StateUpdate, ResearchError> {
    ctx.report(state, Stage::Reflecting, "Reflecting on research quality...", 80.0);

    let prompt = prompts::reflection_prompt(state.query(), &state.draft_research);
    ctx.report(
        state,
        Stage::Reflecting,
        format!("Analyzing draft using {}...", ctx.model_label(state)),
        85.0,
    );

    let critique = ctx.ask(state, &prompt).await?;
    ctx.report(state, Stage::Reflecting, "Improving research based on analysis...", 90.0);

    let revision = prompts::revision_prompt(&state.draft_research, &critique);
    ctx.report(state, Stage::Reflecting, "Finalizing research output...", 95.0);

    let final_research = ctx.ask(state, &revision).await?;
    if final_research.trim().is_empty() {
        return Err(ResearchError::Parse("model returned an empty research report".to_string()));
    }
    ctx.report(state, Stage::Reflecting.next(false), "Research completed successfully", 100.0);

    Ok(StateUpdate {
        final_research: Some(final_research),
        status: Some(Stage::Reflecting.next(false)),
        ..StateUpdate::default()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::mock::MockLlmClient;
    use crate::llm::{GatewayConfig, LlmClient, Throttle};
    use crate::progress::CollectingSink;
    use crate::search::{SearchError, SearchResult};

    struct PerQuery(usize);

    #[async_trait]
    impl WebSearch for PerQuery {
        async fn search(&self, query: &str, _: usize) -> Result<Vec<SearchResult>, SearchError> {
            Ok((0..self.0)
                .map(|i| SearchResult {
                    title: format!("{query} #{i}"),
                    link: format!("https://example.com/{i}"),
                    snippet: String::new(),
                    source: "google".to_string(),
                })
                .collect())
        }
    }

    fn gateway(client: Arc<dyn LlmClient>) -> ModelGateway {
        ModelGateway::new(client, Arc::new(Throttle::new(Duration::ZERO)), GatewayConfig::default())
    }

    #[tokio::test]
    async fn test_plan_parses_marker_lines() {
        let gw = gateway(Arc::new(MockLlmClient::new(
            "- Search Query 1: steel tariffs\n- Search Query 2: steel prices",
        )));
        let web = PerQuery(1);
        let options = PipelineOptions::default();
        let sink = CollectingSink::new();
        let ctx = StageContext::new(&gw, &web, &options, &sink);
        let state = RunState::new("steel", None);

        let update = plan(&ctx, &state).await.unwrap();
        assert_eq!(
            update.search_queries.unwrap(),
            vec!["steel tariffs", "steel prices"]
        );
        assert_eq!(update.status, Some(Stage::Searching));

        let percents: Vec<f32> = sink.events().iter().map(|e| e.percent).collect();
        assert_eq!(percents, vec![10.0, 15.0, 20.0]);
        assert!(sink.events()[1].message.contains("llama3-70b-8192"));
    }

    #[tokio::test]
    async fn test_search_band_stays_monotonic_for_many_queries() {
        let gw = gateway(Arc::new(MockLlmClient::new("unused")));
        let web = PerQuery(2);
        let options = PipelineOptions::default();
        let sink = CollectingSink::new();
        let ctx = StageContext::new(&gw, &web, &options, &sink);
        let mut state = RunState::new("steel", None);
        state.search_queries = (0..8).map(|i| format!("q{i}")).collect();

        let update = search(&ctx, &state).await.unwrap();
        let results = update.search_results.unwrap();
        assert_eq!(results.len(), 16);
        assert_eq!(results[0].title, "q0 #0");
        assert_eq!(results[15].title, "q7 #1");

        let events = sink.events();
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(events.first().unwrap().percent, 25.0);
        assert_eq!(events.last().unwrap().percent, 50.0);
        assert_eq!(
            events.last().unwrap().message,
            "Web search complete. Found 16 total results"
        );
    }

    #[tokio::test]
    async fn test_strict_mode_turns_failure_text_into_error() {
        let gw = gateway(Arc::new(MockLlmClient::new(MAX_RETRIES_MESSAGE)));
        let web = PerQuery(1);
        let options = PipelineOptions {
            treat_failure_text_as_error: true,
            ..PipelineOptions::default()
        };
        let sink = CollectingSink::new();
        let ctx = StageContext::new(&gw, &web, &options, &sink);
        let mut state = RunState::new("steel", None);
        state.search_results = Vec::new();

        let err = synthesize(&ctx, &state).await.unwrap_err();
        assert!(matches!(err, ResearchError::RateLimit(_)));
    }

    #[tokio::test]
    async fn test_lenient_mode_passes_failure_text_through() {
        let gw = gateway(Arc::new(MockLlmClient::new("HTTP Error: 500 boom")));
        let web = PerQuery(1);
        let options = PipelineOptions::default();
        let sink = CollectingSink::new();
        let ctx = StageContext::new(&gw, &web, &options, &sink);
        let state = RunState::new("steel", None);

        let update = synthesize(&ctx, &state).await.unwrap();
        assert_eq!(update.draft_research.as_deref(), Some("HTTP Error: 500 boom"));
        assert_eq!(sink.events().last().unwrap().percent, 75.0);
    }

    #[tokio::test]
    async fn test_reflect_sends_draft_and_critique_to_revision() {
        let mock = Arc::new(MockLlmClient::new("critique"));
        let gw = gateway(mock.clone());
        let web = PerQuery(1);
        let options = PipelineOptions::default();
        let sink = CollectingSink::new();
        let ctx = StageContext::new(&gw, &web, &options, &sink);
        let mut state = RunState::new("steel", None);
        state.draft_research = "the draft".to_string();

        let update = reflect(&ctx, &state).await.unwrap();
        assert_eq!(update.status, Some(Stage::Completed));

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        let revision = calls[1].prompt();
        assert!(revision.contains("the draft") && revision.contains("critique"));

        let last = sink.events().last().cloned().unwrap();
        assert_eq!(last.step, Stage::Completed);
        assert_eq!(last.percent, 100.0);
    }

    #[test]
    fn test_error_prefixes() {
        assert_eq!(error_prefix(Stage::Searching), "Error in executing searches: ");
        assert_eq!(error_prefix(Stage::Reflecting), "Error in reflection: ");
    }
}
