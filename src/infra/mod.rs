//! 基础设施模块
//!
//! 封装外部依赖（provisioning 工具、文件系统、加密、服务商 HTTP API）

pub mod command;
pub mod provider_api;
pub mod vault;
pub mod workspace;

pub use command::{detect_tool, LogSink, ProvisioningRunner, ToolStatus};
pub use provider_api::{ActionStatus, HttpProviderClient, ProviderControl};
pub use vault::{CredentialBundle, CredentialVault, VaultError};
pub use workspace::{WorkspaceLease, WorkspaceManager};
