//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod deployment;
pub mod resource;
pub mod variables;

// Re-exports for convenience
pub use deployment::{
    Deployment, DeploymentState, LogEnvelope, LogEnvelopeError, LogLevel, LogRecord, OperationType,
};
pub use resource::{
    BootstrapProfile, FirewallProfile, FirewallRule, NetworkAddresses, ProviderKind, Resource,
    ResourceStatus, RuleDirection, RuleProtocol,
};
pub use variables::{ProviderVariables, TranslationInput, VariablesError};
