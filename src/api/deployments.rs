//! 资源与部署 API
//!
//! 包含 /resources/*、/deployments/* 端点

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::env::constants::STREAM_POLL_INTERVAL_MS;
use crate::domain::{Deployment, DeploymentState, LogRecord, OperationType, Resource};
use crate::error::ApiResult;
use crate::middleware::RequireApiKey;
use crate::services::orchestration::TaskStatus;
use crate::services::CreateRequest;
use crate::state::{AppState, LogListener};

/// 部署摘要（不含日志）
#[derive(Debug, Serialize)]
pub struct DeploymentView {
    pub id: String,
    pub resource_id: String,
    pub operation: OperationType,
    pub state: DeploymentState,
    pub workspace_id: Option<String>,
    pub initiator: String,
    pub requires_approval: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub plan_summary: Option<String>,
    pub outputs: std::collections::BTreeMap<String, String>,
    pub error_message: Option<String>,
    pub log_count: usize,
    pub stream_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskStatus>,
}

impl DeploymentView {
    fn new(deployment: Deployment, task: Option<TaskStatus>) -> Self {
        Self {
            stream_url: format!("/deployments/{}/logs/stream", deployment.id),
            log_count: deployment.logs.records.len(),
            id: deployment.id,
            resource_id: deployment.resource_id,
            operation: deployment.operation,
            state: deployment.state,
            workspace_id: deployment.workspace_id,
            initiator: deployment.initiator,
            requires_approval: deployment.requires_approval,
            created_at: deployment.created_at,
            started_at: deployment.started_at,
            finished_at: deployment.finished_at,
            plan_summary: deployment.plan_summary,
            outputs: deployment.outputs,
            error_message: deployment.error_message,
            task,
        }
    }
}

/// 创建资源响应
#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub resource: Resource,
    pub deployment: DeploymentView,
}

/// 日志查询参数
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// 只返回序号大于该值的记录
    #[serde(default)]
    pub after: u64,
}

/// 日志快照响应
#[derive(Debug, Serialize)]
pub struct LogSnapshot {
    pub deployment_id: String,
    pub state: DeploymentState,
    pub last_seq: u64,
    pub records: Vec<LogRecord>,
}

/// 创建资源与部署路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/resources", post(create_resource))
        .route("/resources/:id", get(get_resource).delete(destroy_resource))
        .route("/resources/:id/reboot", post(reboot_resource))
        .route("/resources/:id/refresh", post(refresh_resource))
        .route("/deployments/:id", get(get_deployment))
        .route("/deployments/:id/cancel", post(cancel_deployment))
        .route("/deployments/:id/approve", post(approve_deployment))
        .route("/deployments/:id/logs", get(get_logs))
        .route("/deployments/:id/logs/stream", get(stream_logs))
}

fn view(state: &AppState, deployment: Deployment) -> DeploymentView {
    let task = state.orchestrator.task_status(&deployment.id);
    DeploymentView::new(deployment, task)
}

/// 创建资源
///
/// POST /resources
/// 需要 API Key；发起人取自认证头，忽略请求体中的同名字段
async fn create_resource(
    auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(mut request): Json<CreateRequest>,
) -> ApiResult<impl IntoResponse> {
    request.initiator = auth.initiator;

    let (deployment, resource) = state.orchestrator.create(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateResponse {
            resource,
            deployment: view(&state, deployment),
        }),
    ))
}

/// 获取资源
///
/// GET /resources/:id
/// 无需认证
async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.get_resource(&id).await?))
}

/// 重启资源
///
/// POST /resources/:id/reboot
/// 需要 API Key
async fn reboot_resource(
    auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let deployment = state.orchestrator.reboot(&id, &auth.initiator).await?;
    Ok((StatusCode::ACCEPTED, Json(view(&state, deployment))))
}

/// 刷新资源状态
///
/// POST /resources/:id/refresh
/// 需要 API Key
async fn refresh_resource(
    auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let deployment = state.orchestrator.refresh(&id, &auth.initiator).await?;
    Ok((StatusCode::ACCEPTED, Json(view(&state, deployment))))
}

/// 销毁资源
///
/// DELETE /resources/:id
/// 需要 API Key
async fn destroy_resource(
    auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let deployment = state.orchestrator.destroy(&id, &auth.initiator).await?;
    Ok((StatusCode::ACCEPTED, Json(view(&state, deployment))))
}

/// 获取部署状态
///
/// GET /deployments/:id
/// 无需认证
async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let deployment = state.orchestrator.get_deployment(&id).await?;
    Ok(Json(view(&state, deployment)))
}

/// 取消部署
///
/// POST /deployments/:id/cancel
/// 需要 API Key
async fn cancel_deployment(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let deployment = state.orchestrator.cancel(&id).await?;
    Ok(Json(view(&state, deployment)))
}

/// 审批部署
///
/// POST /deployments/:id/approve
/// 需要 API Key
async fn approve_deployment(
    auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let deployment = state.orchestrator.approve(&id).await?;
    tracing::info!(deployment_id = %id, approver = %auth.initiator, "Approval recorded");
    Ok(Json(view(&state, deployment)))
}

/// 日志快照
///
/// GET /deployments/:id/logs?after=<seq>
/// 无需认证
async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<impl IntoResponse> {
    let deployment = state.orchestrator.get_deployment(&id).await?;
    let records: Vec<LogRecord> = state
        .orchestrator
        .logs_snapshot(&id)
        .await?
        .into_iter()
        .filter(|r| r.seq > query.after)
        .collect();

    Ok(Json(LogSnapshot {
        deployment_id: id,
        state: deployment.state,
        last_seq: records.last().map_or(query.after, |r| r.seq),
        records,
    }))
}

fn record_event(record: &LogRecord) -> Event {
    let json = serde_json::to_string(record).unwrap_or_default();
    Event::default().id(record.seq.to_string()).data(json)
}

fn complete_event(deployment: &Deployment) -> Event {
    Event::default().event("complete").data(
        serde_json::json!({
            "state": deployment.state,
            "error_message": deployment.error_message,
        })
        .to_string(),
    )
}

enum Next {
    Record(Option<LogRecord>),
    Tick,
}

/// 流式日志
///
/// GET /deployments/:id/logs/stream?after=<seq>
/// 无需认证
///
/// 先重放缓冲历史，再推送实时记录；部署进入终态后发送 `complete` 事件并结束
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let deployment = state.orchestrator.get_deployment(&id).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
    let listener: Arc<dyn LogListener> = Arc::new(move |record: &LogRecord| {
        let _ = tx.send(record.clone());
    });
    let subscription = state.registry.subscribe(&id, listener);

    let stream = async_stream::stream! {
        let mut last_seq = query.after;

        match subscription {
            // 通道已清理：从存储重放
            None => {
                for record in deployment.logs.since(last_seq) {
                    yield Ok(record_event(record));
                }
                yield Ok(complete_event(&deployment));
            }
            Some(_subscription) => {
                let mut ticker = tokio::time::interval(Duration::from_millis(STREAM_POLL_INTERVAL_MS));
                loop {
                    let next = tokio::select! {
                        record = rx.recv() => Next::Record(record),
                        _ = ticker.tick() => Next::Tick,
                    };

                    match next {
                        Next::Record(Some(record)) => {
                            if record.seq <= last_seq {
                                continue;
                            }
                            if record.seq > last_seq + 1 {
                                // 缓冲已裁剪，从快照（存储加未确认记录）补齐缺口
                                if let Ok(snapshot) = state.orchestrator.logs_snapshot(&id).await {
                                    for missing in snapshot.iter().filter(|r| r.seq > last_seq && r.seq < record.seq) {
                                        yield Ok(record_event(missing));
                                    }
                                }
                            }
                            last_seq = record.seq;
                            yield Ok(record_event(&record));
                        }
                        Next::Record(None) => break,
                        Next::Tick => {
                            let current = match state.store.get_deployment(&id).await {
                                Ok(current) => current,
                                Err(e) => {
                                    warn!(deployment_id = %id, error = %e, "Failed to read deployment for stream");
                                    break;
                                }
                            };
                            let done = current.state.is_terminal()
                                && (state.registry.is_finished(&id) || current.state == DeploymentState::Cancelled);
                            if done {
                                while let Ok(record) = rx.try_recv() {
                                    if record.seq > last_seq {
                                        last_seq = record.seq;
                                        yield Ok(record_event(&record));
                                    }
                                }
                                yield Ok(complete_event(&current));
                                break;
                            }
                        }
                    }
                }
                debug!(deployment_id = %id, last_seq, "Log stream closed");
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::{request, test_state};
    use crate::domain::ProviderKind;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn seed(state: &AppState) -> (Resource, Deployment) {
        let mut resource = Resource::new("web-1", ProviderKind::Hetzner, "acct", "fsn1", "cx22", "ubuntu-24.04");
        resource.provider_resource_id = Some("42".to_string());
        state.store.insert_resource(&resource).await.unwrap();

        let mut deployment = Deployment::new(&resource.id, OperationType::Refresh, Some(resource.workspace_id.clone()), "ops");
        deployment.state = DeploymentState::Succeeded;
        state.store.insert_deployment(&deployment).await.unwrap();
        let records: Vec<LogRecord> = (1..=3)
            .map(|seq| {
                let mut record = LogRecord::info("orchestrator", format!("line {}", seq));
                record.seq = seq;
                record
            })
            .collect();
        state.store.append_logs(&deployment.id, &records).await.unwrap();
        (resource, deployment)
    }

    #[tokio::test]
    async fn test_get_deployment_and_resource() {
        let (state, _dir) = test_state().await;
        let (resource, deployment) = seed(&state).await;
        let app = crate::api::router(Arc::clone(&state));

        let (status, body) = request(app.clone(), Request::get(format!("/deployments/{}", deployment.id)).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "succeeded");
        assert_eq!(body["log_count"], 3);
        assert!(body.get("logs").is_none());

        let (status, body) = request(app.clone(), Request::get(format!("/resources/{}", resource.id)).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["provider"], "hetzner");

        let (status, body) = request(app, Request::get("/deployments/missing").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_logs_snapshot_after() {
        let (state, _dir) = test_state().await;
        let (_, deployment) = seed(&state).await;
        let app = crate::api::router(Arc::clone(&state));

        let (status, body) = request(
            app,
            Request::get(format!("/deployments/{}/logs?after=1", deployment.id)).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records"].as_array().unwrap().len(), 2);
        assert_eq!(body["last_seq"], 3);
    }

    #[tokio::test]
    async fn test_mutations_require_api_key() {
        let (state, _dir) = test_state().await;
        let (resource, deployment) = seed(&state).await;
        let app = crate::api::router(Arc::clone(&state));

        let (status, _) = request(
            app.clone(),
            Request::post(format!("/resources/{}/reboot", resource.id)).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // 终态部署不能取消
        let (status, body) = request(
            app,
            Request::post(format!("/deployments/{}/cancel", deployment.id))
                .header("x-api-key", "test-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "cannot cancel deployment in state succeeded");
    }

    #[tokio::test]
    async fn test_create_without_tool_is_unavailable() {
        let (state, _dir) = test_state().await;
        let app = crate::api::router(Arc::clone(&state));

        let payload = serde_json::json!({
            "name": "web-1",
            "provider": "digitalocean",
            "account_id": "acct",
            "region": "fra1",
            "size": "s-1vcpu-1gb",
            "image": "ubuntu-24-04-x64"
        });
        let (status, body) = request(
            app,
            Request::post("/resources")
                .header("x-api-key", "test-key")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "service_unavailable");
    }

    #[tokio::test]
    async fn test_stream_replays_finished_deployment() {
        let (state, _dir) = test_state().await;
        let (_, deployment) = seed(&state).await;
        let app = crate::api::router(Arc::clone(&state));

        let response = app
            .oneshot(
                Request::get(format!("/deployments/{}/logs/stream", deployment.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let positions: Vec<usize> = ["line 1", "line 2", "line 3", "event: complete"]
            .iter()
            .map(|needle| text.find(needle).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{}", text);
        assert!(text.contains(r#""state":"succeeded""#));
    }

    #[tokio::test]
    async fn test_stream_follows_live_channel_until_terminal() {
        let (state, _dir) = test_state().await;
        let (_, deployment) = seed(&state).await;

        // 模拟运行中的部署：通道接在已持久化的序号之后
        let mut running = state.store.get_deployment(&deployment.id).await.unwrap();
        running.state = DeploymentState::Applying;
        state.store.update_deployment(&running).await.unwrap();
        state.registry.resume(&deployment.id, 3);
        state.registry.publish(&deployment.id, LogRecord::info("tool:apply", "Creating..."));

        let app = crate::api::router(Arc::clone(&state));
        let response = app
            .oneshot(
                Request::get(format!("/deployments/{}/logs/stream?after=3", deployment.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let finisher = {
            let state = Arc::clone(&state);
            let id = deployment.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                state.registry.publish(&id, LogRecord::info("tool:apply", "Apply complete!"));
                let mut done = state.store.get_deployment(&id).await.unwrap();
                done.state = DeploymentState::Succeeded;
                state.store.update_deployment(&done).await.unwrap();
                state.registry.finish(&id);
            })
        };

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        finisher.await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(!text.contains("line 3"));
        let creating = text.find("Creating...").unwrap();
        let complete = text.find("Apply complete!").unwrap();
        let end = text.find("event: complete").unwrap();
        assert!(creating < complete && complete < end, "{}", text);
        assert!(text.contains("id: 5"));
    }
}
