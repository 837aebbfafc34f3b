//! 统一错误处理
//!
//! - `OrchestrationError`：编排流程中的领域错误，在操作边界记录到 Deployment
//! - `ApiError`：HTTP 边界错误，实现 `IntoResponse`

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::domain::{DeploymentState, VariablesError};
use crate::infra::VaultError;
use crate::state::store::StoreError;

/// 编排错误
///
/// 所有变体都在操作边界被捕获，写入 `Deployment.error_message` 并反映到资源状态
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("provisioning tool '{0}' is not available")]
    ToolUnavailable(String),

    #[error("provisioning module '{0}' not found")]
    ModuleNotFound(String),

    #[error("workspace io error at {path}: {source}")]
    WorkspaceIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("plan failed: {0}")]
    PlanFailed(String),

    #[error("apply failed: {0}")]
    ApplyFailed(String),

    #[error("destroy failed: {0}")]
    DestroyFailed(String),

    #[error("no credentials stored for account '{0}'")]
    CredentialsNotFound(String),

    #[error("credentials rejected: {0}")]
    CredentialsInvalid(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("deployment was cancelled")]
    Cancelled,

    #[error("invalid variables: {0}")]
    InvalidVariables(#[from] VariablesError),

    #[error("cannot {action} deployment in state {from}")]
    InvalidTransition {
        from: DeploymentState,
        action: &'static str,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provider api error: {0}")]
    Provider(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl OrchestrationError {
    pub fn workspace_io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::WorkspaceIo {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 409 - 冲突（如：部署已在进行）
    Conflict(String),
    /// 500 - 内部错误
    Internal(String),
    /// 503 - 服务不可用
    ServiceUnavailable(String),
}

impl ApiError {
    /// 创建未授权错误
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    /// 创建未找到错误
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// 创建请求无效错误
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid or missing API key".to_string(),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{} not found", resource),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Conflict(m) => write!(f, "Conflict: {}", m),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
            ApiError::ServiceUnavailable(m) => write!(f, "Service unavailable: {}", m),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<OrchestrationError> for ApiError {
    fn from(err: OrchestrationError) -> Self {
        match err {
            OrchestrationError::NotFound(what)
            | OrchestrationError::Store(StoreError::NotFound(what)) => ApiError::NotFound(what),
            OrchestrationError::Conflict(_) | OrchestrationError::InvalidTransition { .. } => {
                ApiError::Conflict(err.to_string())
            }
            OrchestrationError::InvalidVariables(_)
            | OrchestrationError::InvalidIdentifier(_)
            | OrchestrationError::CredentialsNotFound(_)
            | OrchestrationError::ModuleNotFound(_) => ApiError::BadRequest(err.to_string()),
            OrchestrationError::ToolUnavailable(_) => ApiError::ServiceUnavailable(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::InvalidAccountId(_) => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;
