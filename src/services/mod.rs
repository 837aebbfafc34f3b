//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod orchestration;

pub use orchestration::{CreateRequest, Orchestrator, OrchestratorSettings};
