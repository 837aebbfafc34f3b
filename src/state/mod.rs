//! 运行时状态模块
//!
//! 管理应用状态、部署存储和日志广播

pub mod app_state;
pub mod log_hub;
pub mod store;

pub use app_state::AppState;
pub use log_hub::{LogBroadcastRegistry, LogListener, Subscription};
pub use store::{DeploymentStore, FileStore, MemoryStore, StoreError};
