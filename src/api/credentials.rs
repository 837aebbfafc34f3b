//! 凭据管理 API
//!
//! 包含 /credentials/:account_id 端点。令牌只写入凭据库，不会出现在响应或日志中。

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::put,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::infra::CredentialBundle;
use crate::middleware::RequireApiKey;
use crate::state::AppState;

/// 保存凭据请求
#[derive(Deserialize)]
pub struct StoreCredentialsRequest {
    pub api_token: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// 凭据摘要（不含任何秘密值）
#[derive(Debug, Serialize)]
pub struct CredentialSummary {
    pub account_id: String,
    pub extra_keys: Vec<String>,
}

/// 创建凭据路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/credentials/:account_id",
        put(store_credentials)
            .get(describe_credentials)
            .delete(delete_credentials),
    )
}

/// 保存凭据（覆盖已有）
///
/// PUT /credentials/:account_id
/// 需要 API Key
async fn store_credentials(
    auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(req): Json<StoreCredentialsRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.api_token.trim().is_empty() {
        return Err(ApiError::bad_request("api_token must not be empty"));
    }

    let bundle = CredentialBundle {
        api_token: req.api_token,
        extra: req.extra,
    };
    state.vault.store(&account_id, &bundle).await?;
    info!(account_id = %account_id, initiator = %auth.initiator, "Credentials updated via API");

    Ok(StatusCode::NO_CONTENT)
}

/// 查看凭据是否存在
///
/// GET /credentials/:account_id
/// 需要 API Key
async fn describe_credentials(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let bundle = state
        .vault
        .get(&account_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("credentials for {}", account_id)))?;

    Ok(Json(CredentialSummary {
        account_id,
        extra_keys: bundle.extra.into_keys().collect(),
    }))
}

/// 删除凭据
///
/// DELETE /credentials/:account_id
/// 需要 API Key
async fn delete_credentials(
    auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !state.vault.delete(&account_id).await? {
        return Err(ApiError::not_found(format!("credentials for {}", account_id)));
    }
    info!(account_id = %account_id, initiator = %auth.initiator, "Credentials deleted via API");
    Ok(StatusCode::NO_CONTENT)
}
