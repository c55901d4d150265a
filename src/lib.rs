//! Researcher - Rust 研究智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、服务装配、运行监管
//! - **history**: 研究历史（内存 / SQLite）
//! - **llm**: 模型客户端抽象与实现（OpenAI 兼容 / Mock）、节流、模型网关、结构化抽取
//! - **observability**: 日志初始化
//! - **progress**: 按 run 扇出的进度分发
//! - **research**: 规划 → 搜索 → 综合 → 反思 四阶段流水线
//! - **search**: 网页搜索（Serper）与不失败的搜索网关

pub mod config;
pub mod core;
pub mod history;
pub mod llm;
pub mod observability;
pub mod progress;
pub mod research;
pub mod search;

pub use crate::core::{ResearchError, ResearcherBuilder, RunSupervisor};
pub use research::{ResearchPipeline, ResearchResponse};
