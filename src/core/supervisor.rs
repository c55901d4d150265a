//! 运行监管：生成 run ID、后台启动流水线、记录终态响应并写入历史
//!
//! 每个 run 在独立的 tokio 任务上执行；`start_research` 登记后立即返回，不等待完成。
//! 不支持取消：run 一旦开始就会跑到完成或出错。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio_util::task::TaskTracker;

use crate::core::ResearchError;
use crate::history::HistoryStore;
use crate::llm::ModelGateway;
use crate::progress::ProgressHub;
use crate::research::engine::panic_message;
use crate::research::{ProgressEvent, ResearchPipeline, ResearchResponse, Stage};

pub type RunId = String;

struct RunRecord {
    user_id: String,
    query: String,
    model: String,
    started_at: i64,
    finished_at: Option<Instant>,
    done: watch::Sender<Option<ResearchResponse>>,
}

/// 某个 run 的可查询视图
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub user_id: String,
    pub query: String,
    pub model: String,
    /// 毫秒时间戳
    pub started_at: i64,
    pub status: Stage,
    pub message: String,
    pub percent: f32,
    pub result: Option<ResearchResponse>,
}

pub struct RunSupervisor {
    pipeline: Arc<ResearchPipeline>,
    hub: Arc<ProgressHub>,
    history: Arc<dyn HistoryStore>,
    runs: Arc<RwLock<HashMap<RunId, RunRecord>>>,
    tracker: TaskTracker,
}

impl RunSupervisor {
    pub fn new(
        pipeline: Arc<ResearchPipeline>,
        hub: Arc<ProgressHub>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            pipeline,
            hub,
            history,
            runs: Arc::new(RwLock::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn gateway(&self) -> &Arc<ModelGateway> {
        self.pipeline.gateway()
    }

    /// 登记 run 并在后台执行流水线，立即返回 run ID（`<user_id>_<uuid>`）
    ///
    /// 完成后（成功或失败）先把响应写入历史，再唤醒 [`wait`](Self::wait) 的调用方。
    pub async fn start_research(&self, user_id: &str, query: &str, model: Option<&str>) -> RunId {
        let run_id = format!("{}_{}", user_id, uuid::Uuid::new_v4());
        let resolved_model = self.gateway().resolve_model(model).to_string();
        let (done, _) = watch::channel(None);

        self.runs.write().await.insert(
            run_id.clone(),
            RunRecord {
                user_id: user_id.to_string(),
                query: query.to_string(),
                model: resolved_model.clone(),
                started_at: chrono::Utc::now().timestamp_millis(),
                finished_at: None,
                done,
            },
        );
        tracing::info!(run_id = %run_id, user_id, query, model = %resolved_model, "research run registered");

        let pipeline = Arc::clone(&self.pipeline);
        let hub = Arc::clone(&self.hub);
        let history = Arc::clone(&self.history);
        let runs = Arc::clone(&self.runs);
        let user_id = user_id.to_string();
        let query = query.to_string();
        let task_run_id = run_id.clone();

        self.tracker.spawn(async move {
            let run_id = task_run_id;
            let reporter = hub.reporter(run_id.clone());
            let outcome = AssertUnwindSafe(pipeline.run(&query, Some(resolved_model.as_str()), &reporter))
                .catch_unwind()
                .await;

            let response = match outcome {
                Ok(response) => response,
                Err(panic) => {
                    let message = format!("Unexpected error: {}", panic_message(panic.as_ref()));
                    tracing::error!(run_id = %run_id, error = %message, "research task panicked");
                    hub.notify(&run_id, &ProgressEvent::error(message.clone(), query.as_str()));
                    ResearchResponse::unexpected_error(&query, Some(resolved_model.as_str()), message)
                }
            };

            if let Err(e) = history.append(&user_id, &query, &response).await {
                tracing::warn!(run_id = %run_id, error = %e, "failed to persist research history");
            }

            if let Some(record) = runs.write().await.get_mut(&run_id) {
                record.finished_at = Some(Instant::now());
                record.done.send_replace(Some(response.clone()));
            }
            tracing::info!(run_id = %run_id, status = %response.status, "research run finished");
        });

        run_id
    }

    /// 当前状态：最新进度事件 + 终态响应（若已完成）
    pub async fn snapshot(&self, run_id: &str) -> Option<RunSnapshot> {
        let runs = self.runs.read().await;
        let record = runs.get(run_id)?;
        let result = record.done.borrow().clone();
        let latest = self.hub.latest(run_id);

        let (status, message, percent) = match (&latest, &result) {
            (Some(ev), _) => (ev.step, ev.message.clone(), ev.percent),
            (None, Some(r)) => (r.status, String::new(), if r.is_success() { 100.0 } else { 0.0 }),
            (None, None) => (Stage::Planning, "Research queued".to_string(), 0.0),
        };

        Some(RunSnapshot {
            run_id: run_id.to_string(),
            user_id: record.user_id.clone(),
            query: record.query.clone(),
            model: record.model.clone(),
            started_at: record.started_at,
            status,
            message,
            percent,
            result,
        })
    }

    /// 等待某个 run 结束并返回其响应
    pub async fn wait(&self, run_id: &str) -> Result<ResearchResponse, ResearchError> {
        let mut rx = {
            let runs = self.runs.read().await;
            runs.get(run_id)
                .map(|r| r.done.subscribe())
                .ok_or_else(|| ResearchError::RunNotFound(run_id.to_string()))?
        };

        let done = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ResearchError::RunNotFound(run_id.to_string()))?;
        done.clone()
            .ok_or_else(|| ResearchError::RunNotFound(run_id.to_string()))
    }

    /// 仍在执行的 run 数量
    pub async fn active_runs(&self) -> usize {
        self.runs
            .read()
            .await
            .values()
            .filter(|r| r.finished_at.is_none())
            .count()
    }

    /// 移除结束超过 max_age 的 run（连同进度缓存），返回移除数量
    pub async fn prune_finished(&self, max_age: Duration) -> usize {
        let mut runs = self.runs.write().await;
        let expired: Vec<RunId> = runs
            .iter()
            .filter(|(_, r)| r.finished_at.is_some_and(|t| t.elapsed() >= max_age))
            .map(|(id, _)| id.clone())
            .collect();

        for run_id in &expired {
            runs.remove(run_id);
            self.hub.remove(run_id);
        }
        if !expired.is_empty() {
            tracing::debug!(pruned = expired.len(), "pruned finished research runs");
        }
        expired.len()
    }

    /// 停止接收新任务并等待所有在途 run 结束
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::history::InMemoryHistoryStore;
    use crate::llm::mock::MockLlmClient;
    use crate::llm::{GatewayConfig, Throttle};
    use crate::research::PipelineOptions;
    use crate::search::{SearchError, SearchResult, WebSearch};

    struct OneResult;

    #[async_trait]
    impl WebSearch for OneResult {
        async fn search(&self, query: &str, _: usize) -> Result<Vec<SearchResult>, SearchError> {
            Ok(vec![SearchResult {
                title: query.to_string(),
                link: "https://example.com".to_string(),
                snippet: "snippet".to_string(),
                source: "google".to_string(),
            }])
        }
    }

    fn supervisor() -> RunSupervisor {
        let gateway = ModelGateway::new(
            Arc::new(MockLlmClient::new("- Search Query 1: steel")),
            Arc::new(Throttle::new(Duration::ZERO)),
            GatewayConfig::default(),
        );
        let pipeline = ResearchPipeline::new(
            Arc::new(gateway),
            Arc::new(OneResult),
            PipelineOptions::default(),
        );
        RunSupervisor::new(
            Arc::new(pipeline),
            Arc::new(ProgressHub::new()),
            Arc::new(InMemoryHistoryStore::new()),
        )
    }

    #[tokio::test]
    async fn test_run_id_is_prefixed_by_user() {
        let sup = supervisor();
        let run_id = sup.start_research("alice", "steel", None).await;
        assert!(run_id.starts_with("alice_"));
        assert_eq!(run_id.len(), "alice_".len() + 36);
        sup.wait(&run_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_response_and_history_is_written() {
        let sup = supervisor();
        let run_id = sup.start_research("u1", "steel", Some("gemma2-9b-it")).await;

        let response = sup.wait(&run_id).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.model.as_deref(), Some("gemma2-9b-it"));

        let entries = sup.history().list("u1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].results, response);

        let snap = sup.snapshot(&run_id).await.unwrap();
        assert_eq!(snap.status, Stage::Completed);
        assert_eq!(snap.percent, 100.0);
        assert_eq!(snap.result, Some(response));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let sup = supervisor();
        assert!(sup.snapshot("nope").await.is_none());
        assert!(matches!(
            sup.wait("nope").await,
            Err(ResearchError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_prune_finished_and_shutdown() {
        let sup = supervisor();
        let run_id = sup.start_research("u1", "steel", None).await;
        sup.wait(&run_id).await.unwrap();
        sup.shutdown().await;

        assert_eq!(sup.active_runs().await, 0);
        assert_eq!(sup.prune_finished(Duration::ZERO).await, 1);
        assert!(sup.snapshot(&run_id).await.is_none());
        assert!(sup.hub().latest(&run_id).is_none());
    }
}
