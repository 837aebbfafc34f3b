//! API Key 认证
//!
//! `RequireApiKey` extractor 保护所有会修改状态的端点。
//! 密钥可以放在 `x-api-key` 或 `Authorization: Bearer <key>` 中；
//! 可选的 `x-initiator` 头记录到部署的发起人字段。

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, header::HeaderMap, request::Parts},
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_INITIATOR: &str = "api";

/// 已认证的调用方
#[derive(Debug, Clone)]
pub struct RequireApiKey {
    pub initiator: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        verify_api_key(&parts.headers, &state.api_key)
    }
}

fn provided_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// 验证 API Key 并解析发起人
pub fn verify_api_key(headers: &HeaderMap, expected_key: &str) -> Result<RequireApiKey, ApiError> {
    match provided_key(headers) {
        Some(key) if key == expected_key => {
            let initiator = headers
                .get("x-initiator")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_INITIATOR)
                .to_string();
            Ok(RequireApiKey { initiator })
        }
        Some(_) => {
            tracing::warn!("Invalid API key provided");
            Err(ApiError::unauthorized())
        }
        None => {
            tracing::warn!("Missing API key");
            Err(ApiError::unauthorized())
        }
    }
}
