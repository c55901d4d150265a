//! 核心编排层：错误分类、服务装配、运行监管

pub mod builder;
pub mod error;
pub mod supervisor;

pub use builder::ResearcherBuilder;
pub use error::ResearchError;
pub use supervisor::{RunId, RunSnapshot, RunSupervisor};
