//! 健康检查 API
//!
//! 包含 /health, /status 端点

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::state::AppState;

/// 工具状态摘要
#[derive(Debug, Serialize)]
struct ToolSummary {
    binary: String,
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

/// 日志通道摘要
#[derive(Debug, Serialize)]
struct LogChannelSummary {
    total: usize,
    active: usize,
}

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    /// 工具缺失时为 degraded，只读端点仍然可用
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    started_at: String,
    uptime_secs: i64,
    tool: ToolSummary,
    active_tasks: usize,
    log_channels: LogChannelSummary,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(health_check))
}

/// 健康检查 - 返回状态、版本、运行时间等信息
///
/// GET /health, GET /status
/// 无需认证
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tool = state.orchestrator.tool();
    let now = chrono::Utc::now();

    Json(HealthResponse {
        status: if tool.available() { "ok" } else { "degraded" },
        service: "xjp-provision-agent",
        version: VERSION,
        timestamp: now.to_rfc3339(),
        started_at: state.started_at.to_rfc3339(),
        uptime_secs: (now - state.started_at).num_seconds(),
        tool: ToolSummary {
            binary: tool.binary.clone(),
            available: tool.available(),
            path: tool.path.as_ref().map(|p| p.display().to_string()),
        },
        active_tasks: state.orchestrator.supervisor().active_count(),
        log_channels: LogChannelSummary {
            total: state.registry.count(),
            active: state.registry.active_count(),
        },
    })
}
