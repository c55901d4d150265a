//! Researcher HTTP 接口（axum）
//!
//! - `GET /api/health`：健康检查（无需鉴权）
//! - `GET /api/models`：可用模型与默认模型
//! - `POST /api/research`：启动研究，立即返回 task_id
//! - `GET /api/research/:id`：run 快照
//! - `GET /api/research/:id/events`：SSE 进度流（先回放最新事件，终态后结束）
//! - `GET|DELETE /api/history`：按 X-User-ID 查看 / 清空历史
//!
//! 除 health 外均需 `X-Api-Key`：服务端未配置 Key 返回 500，不匹配返回 401。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use researcher::config::load_config;
use researcher::core::{ResearcherBuilder, RunSupervisor};
use researcher::history::{HistoryEntry, HistoryStore};
use researcher::observability;
use researcher::research::ProgressEvent;

const API_KEY_HEADER: &str = "x-api-key";
const USER_ID_HEADER: &str = "x-user-id";
/// 已结束的 run 保留多久后从注册表清除
const FINISHED_RUN_TTL: Duration = Duration::from_secs(3600);

struct AppState {
    supervisor: RunSupervisor,
    api_key: Option<String>,
    allowed_origins: Vec<String>,
}

type SharedState = Arc<AppState>;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn require_user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    user_id(headers).ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Missing X-User-ID header"))
}

/// X-Api-Key 校验
async fn require_api_key(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        tracing::error!("API key not configured");
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "Server configuration error")
            .into_response();
    };

    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if provided != Some(expected) {
        tracing::warn!(path = %req.uri().path(), "rejected request with invalid API key");
        return api_error(StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    next.run(req).await
}

/// 只放行 allowed_origins 中的来源；预检请求由该层直接应答
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(API_KEY_HEADER),
            HeaderName::from_static(USER_ID_HEADER),
        ])
}

fn router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/api/models", get(api_models))
        .route("/api/research", post(api_research_start))
        .route("/api/research/:id", get(api_research_status))
        .route("/api/research/:id/events", get(api_research_events))
        .route("/api/history", get(api_history_list).delete(api_history_clear))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ));

    Router::new()
        .route("/api/health", get(api_health))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&state.allowed_origins)),
        )
        .with_state(state)
}

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<String>,
    default: String,
}

/// GET /api/models
async fn api_models(State(state): State<SharedState>) -> Json<ModelsResponse> {
    let gateway = state.supervisor.gateway();
    Json(ModelsResponse {
        models: gateway.available_models().to_vec(),
        default: gateway.default_model().to_string(),
    })
}

#[derive(Deserialize)]
struct ResearchRequest {
    query: Option<String>,
    model: Option<String>,
}

#[derive(Serialize)]
struct ResearchStarted {
    task_id: String,
    query: String,
    model: String,
    user_id: String,
    status: &'static str,
}

/// POST /api/research：校验后登记 run 并立即返回
async fn api_research_start(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<ResearchRequest>,
) -> Result<Json<ResearchStarted>, ApiError> {
    let query = body
        .query
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Missing 'query' field in request"))?;

    let gateway = state.supervisor.gateway();
    let model = body
        .model
        .unwrap_or_else(|| gateway.default_model().to_string());
    if !gateway.is_available(&model) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "Invalid model. Available models: {}",
                gateway.available_models().join(", ")
            ),
        ));
    }

    let user_id = user_id(&headers).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let task_id = state
        .supervisor
        .start_research(&user_id, &query, Some(model.as_str()))
        .await;

    Ok(Json(ResearchStarted {
        task_id,
        query,
        model,
        user_id,
        status: "started",
    }))
}

/// GET /api/research/:id
async fn api_research_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state
        .supervisor
        .snapshot(&id)
        .await
        .map(|snap| Json(snap).into_response())
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Unknown task: {id}")))
}

/// GET /api/research/:id/events：SSE 进度流，终态事件后关闭
async fn api_research_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if state.supervisor.snapshot(&id).await.is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("Unknown task: {id}")));
    }

    let (_, rx) = state.supervisor.hub().subscribe_channel(&id);
    let events = stream::unfold(
        (rx, false),
        |(mut rx, finished): (mpsc::UnboundedReceiver<ProgressEvent>, bool)| async move {
            if finished {
                return None;
            }
            let event = rx.recv().await?;
            let data = serde_json::to_string(&event).unwrap_or_default();
            let sse = Event::default().event(event.step.as_str()).data(data);
            Some((Ok::<_, std::convert::Infallible>(sse), (rx, event.is_terminal())))
        },
    );

    Ok(Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response())
}

#[derive(Serialize)]
struct HistoryResponse {
    history: Vec<HistoryEntry>,
}

/// GET /api/history
async fn api_history_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, ApiError> {
    let user_id = require_user_id(&headers)?;
    let history = state
        .supervisor
        .history()
        .list(&user_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to load history");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        })?;
    Ok(Json(HistoryResponse { history }))
}

/// DELETE /api/history
async fn api_history_clear(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user_id(&headers)?;
    let success = state
        .supervisor
        .history()
        .clear(&user_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to clear history");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        })?;
    Ok(Json(serde_json::json!({ "success": success })))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let api_key = cfg.web.resolved_api_key();
    if api_key.is_none() {
        tracing::warn!("no API key configured; protected routes will answer 500");
    }
    let addr = format!("{}:{}", cfg.web.host, cfg.web.port);
    let allowed_origins = cfg.web.allowed_origins.clone();

    let supervisor = ResearcherBuilder::new(cfg)
        .build()
        .context("Failed to build research pipeline")?;
    let state = Arc::new(AppState {
        supervisor,
        api_key,
        allowed_origins,
    });

    // 定期清理已结束的 run
    let prune_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        interval.tick().await;
        loop {
            interval.tick().await;
            prune_state.supervisor.prune_finished(FINISHED_RUN_TTL).await;
        }
    });

    let app = router(Arc::clone(&state));
    tracing::info!("Researcher API: http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received Ctrl+C, shutting down");
        })
        .await?;

    state.supervisor.shutdown().await;
    Ok(())
}
