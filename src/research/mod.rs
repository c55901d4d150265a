//! 研究流水线：状态与路由、提示词、四个阶段、引擎

pub mod engine;
pub mod prompts;
pub mod stages;
pub mod state;

pub use engine::{PipelineOptions, ResearchPipeline};
pub use stages::StageContext;
pub use state::{
    route, ProgressEvent, ResearchResponse, Route, RunState, Stage, StateUpdate,
};
