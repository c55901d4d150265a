//! 研究状态：阶段枚举、路由、贯穿四个阶段的 RunState、进度事件与最终响应
//!
//! 阶段只能按 Planning → Searching → Synthesizing → Reflecting → Completed 前进，或跳到 Error；
//! error 一旦写入，status 即为 Error，路由随即终止。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::search::SearchResult;

/// 阶段（声明顺序即前进顺序，Error 排在最后）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Planning,
    Searching,
    Synthesizing,
    Reflecting,
    Completed,
    Error,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Searching => "searching",
            Self::Synthesizing => "synthesizing",
            Self::Reflecting => "reflecting",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// 转移表：出错一律进入 Error，否则进入固定顺序中的下一阶段；终态保持不变
    pub fn next(self, has_error: bool) -> Stage {
        if has_error {
            return Self::Error;
        }
        match self {
            Self::Planning => Self::Searching,
            Self::Searching => Self::Synthesizing,
            Self::Synthesizing => Self::Reflecting,
            Self::Reflecting => Self::Completed,
            Self::Completed => Self::Completed,
            Self::Error => Self::Error,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 路由结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Run(Stage),
    End,
}

/// 纯函数路由：有 error 或已到终态 → 结束；否则执行 status 所指的阶段
pub fn route(state: &RunState) -> Route {
    if state.has_error() || state.status.is_terminal() {
        Route::End
    } else {
        Route::Run(state.status)
    }
}

/// 进度事件；step 为 Error 时 percent 固定为 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub step: Stage,
    pub message: String,
    pub percent: f32,
    pub query: String,
}

impl ProgressEvent {
    pub fn new(step: Stage, message: impl Into<String>, percent: f32, query: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            percent: percent.clamp(0.0, 100.0),
            query: query.into(),
        }
    }

    pub fn error(message: impl Into<String>, query: impl Into<String>) -> Self {
        Self::new(Stage::Error, message, 0.0, query)
    }

    pub fn is_terminal(&self) -> bool {
        self.step.is_terminal()
    }
}

/// 贯穿所有阶段的可变记录
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    query: String,
    model: Option<String>,
    pub search_queries: Vec<String>,
    pub search_results: Vec<SearchResult>,
    pub draft_research: String,
    pub final_research: String,
    pub status: Stage,
    #[serde(skip)]
    pub progress: Option<ProgressEvent>,
    pub error: Option<String>,
}

impl RunState {
    pub fn new(query: impl Into<String>, model: Option<&str>) -> Self {
        Self {
            query: query.into(),
            model: model.map(str::to_string),
            search_queries: Vec::new(),
            search_results: Vec::new(),
            draft_research: String::new(),
            final_research: String::new(),
            status: Stage::Planning,
            progress: None,
            error: None,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn has_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    /// 合并阶段输出；status 只接受前进，error 写入后 status 强制为 Error
    pub fn apply(&mut self, update: StateUpdate) {
        if let Some(q) = update.search_queries {
            self.search_queries = q;
        }
        if let Some(r) = update.search_results {
            self.search_results = r;
        }
        if let Some(d) = update.draft_research {
            self.draft_research = d;
        }
        if let Some(f) = update.final_research {
            self.final_research = f;
        }
        if let Some(e) = update.error.filter(|e| !e.is_empty()) {
            self.error = Some(e);
        }

        if self.has_error() {
            self.status = Stage::Error;
            return;
        }
        if let Some(next) = update.status {
            if next > self.status {
                self.status = next;
            } else if next != self.status {
                tracing::warn!(from = %self.status, to = %next, "ignoring backward status transition");
            }
        }
    }
}

/// 阶段输出：只包含该阶段写入的字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub search_queries: Option<Vec<String>>,
    pub search_results: Option<Vec<SearchResult>>,
    pub draft_research: Option<String>,
    pub final_research: Option<String>,
    pub status: Option<Stage>,
    pub error: Option<String>,
}

impl StateUpdate {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            status: Some(Stage::Error),
            ..Self::default()
        }
    }
}

/// 一次研究的最终响应（成功与失败同一形状）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchResponse {
    pub query: String,
    pub model: Option<String>,
    pub status: Stage,
    /// final_research，为空时回退 draft_research
    pub research: String,
    pub search_queries: Vec<String>,
    pub search_results: Vec<SearchResult>,
    pub error: Option<String>,
}

impl ResearchResponse {
    pub fn from_state(state: &RunState) -> Self {
        let research = if state.final_research.is_empty() {
            state.draft_research.clone()
        } else {
            state.final_research.clone()
        };
        Self {
            query: state.query.clone(),
            model: state.model.clone(),
            status: state.status,
            research,
            search_queries: state.search_queries.clone(),
            search_results: state.search_results.clone(),
            error: state.error.clone(),
        }
    }

    /// 流水线之外的意外失败（如任务 panic）
    pub fn unexpected_error(query: &str, model: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            query: query.to_string(),
            model: model.map(str::to_string),
            status: Stage::Error,
            research: String::new(),
            search_queries: Vec::new(),
            search_results: Vec::new(),
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Stage::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        assert_eq!(Stage::Planning.next(false), Stage::Searching);
        assert_eq!(Stage::Searching.next(false), Stage::Synthesizing);
        assert_eq!(Stage::Synthesizing.next(false), Stage::Reflecting);
        assert_eq!(Stage::Reflecting.next(false), Stage::Completed);
        assert_eq!(Stage::Completed.next(false), Stage::Completed);
        for stage in [Stage::Planning, Stage::Searching, Stage::Reflecting] {
            assert_eq!(stage.next(true), Stage::Error);
        }
    }

    #[test]
    fn test_route_follows_status_and_stops_on_error() {
        let mut state = RunState::new("q", None);
        assert_eq!(route(&state), Route::Run(Stage::Planning));

        state.status = Stage::Synthesizing;
        assert_eq!(route(&state), Route::Run(Stage::Synthesizing));

        state.error = Some("boom".to_string());
        assert_eq!(route(&state), Route::End);

        let mut done = RunState::new("q", None);
        done.status = Stage::Completed;
        assert_eq!(route(&done), Route::End);
    }

    #[test]
    fn test_apply_never_regresses() {
        let mut state = RunState::new("q", None);
        state.apply(StateUpdate {
            status: Some(Stage::Reflecting),
            ..StateUpdate::default()
        });
        state.apply(StateUpdate {
            status: Some(Stage::Searching),
            ..StateUpdate::default()
        });
        assert_eq!(state.status, Stage::Reflecting);
    }

    #[test]
    fn test_apply_error_forces_error_status() {
        let mut state = RunState::new("q", None);
        state.apply(StateUpdate {
            error: Some("Error in planning search: x".to_string()),
            status: Some(Stage::Searching),
            ..StateUpdate::default()
        });
        assert_eq!(state.status, Stage::Error);
        assert!(state.has_error());

        state.apply(StateUpdate {
            status: Some(Stage::Completed),
            ..StateUpdate::default()
        });
        assert_eq!(state.status, Stage::Error);
    }

    #[test]
    fn test_response_falls_back_to_draft() {
        let mut state = RunState::new("q", Some("gemma2-9b-it"));
        state.draft_research = "draft".to_string();
        assert_eq!(ResearchResponse::from_state(&state).research, "draft");
        state.final_research = "final".to_string();
        let resp = ResearchResponse::from_state(&state);
        assert_eq!(resp.research, "final");
        assert_eq!(resp.model.as_deref(), Some("gemma2-9b-it"));
    }

    #[test]
    fn test_stage_serializes_lowercase() {
        let ev = ProgressEvent::new(Stage::Synthesizing, "m", 120.0, "q");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["step"], "synthesizing");
        assert_eq!(json["percent"], 100.0);
    }
}
