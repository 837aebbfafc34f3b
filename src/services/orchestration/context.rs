//! 单次部署操作的执行上下文
//!
//! 日志先进入广播中心（实时分发），再按批持久化到存储。记录在存储确认写入前
//! 一直保留在广播中心，写入失败的批次会在下一次持久化时重试。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{LogRecord, OperationType};
use crate::infra::LogSink;
use crate::state::log_hub::LogBroadcastRegistry;
use crate::state::store::DeploymentStore;

const SOURCE: &str = "orchestrator";

/// 操作上下文
#[derive(Clone)]
pub struct OperationContext {
    pub deployment_id: String,
    pub resource_id: String,
    pub operation: OperationType,
    registry: Arc<LogBroadcastRegistry>,
    store: Arc<dyn DeploymentStore>,
}

impl OperationContext {
    pub fn new(
        deployment_id: impl Into<String>,
        resource_id: impl Into<String>,
        operation: OperationType,
        registry: Arc<LogBroadcastRegistry>,
        store: Arc<dyn DeploymentStore>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            resource_id: resource_id.into(),
            operation,
            registry,
            store,
        }
    }

    /// 作为工具执行器的日志输出
    pub fn sink(&self) -> Arc<dyn LogSink> {
        Arc::new(self.clone())
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogRecord::info(SOURCE, message));
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(LogRecord::warn(SOURCE, message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogRecord::error(SOURCE, message));
    }

    /// 持久化尚未写入存储的日志
    ///
    /// 同一部署的持久化互斥执行；失败时记录保持未确认状态，下次重试
    pub async fn flush(&self) {
        let Some(flush_lock) = self.registry.flush_lock(&self.deployment_id) else {
            return;
        };
        let _guard = flush_lock.lock().await;

        let records = self.registry.pending(&self.deployment_id);
        let Some(last_seq) = records.last().map(|r| r.seq) else {
            return;
        };
        match self.store.append_logs(&self.deployment_id, &records).await {
            Ok(_) => self.registry.acknowledge(&self.deployment_id, last_seq),
            Err(e) => {
                warn!(
                    deployment_id = %self.deployment_id,
                    records = records.len(),
                    error = %e,
                    "Failed to persist deployment logs, will retry"
                );
            }
        }
    }

    /// 在后台按固定间隔持久化日志
    ///
    /// 令牌被取消或通道完成后停止
    pub fn spawn_periodic_flush(&self, period: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let ctx = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if ctx.registry.is_finished(&ctx.deployment_id) {
                            break;
                        }
                        ctx.flush().await;
                    }
                }
            }
            debug!(deployment_id = %ctx.deployment_id, "Periodic log flush stopped");
        });

        token
    }
}

impl LogSink for OperationContext {
    fn emit(&self, record: LogRecord) {
        self.registry.publish(&self.deployment_id, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Deployment, ProviderKind, Resource};
    use crate::state::store::MemoryStore;

    fn context(
        store: &Arc<dyn DeploymentStore>,
        registry: &Arc<LogBroadcastRegistry>,
        deployment: &Deployment,
    ) -> OperationContext {
        registry.create(&deployment.id);
        OperationContext::new(
            &deployment.id,
            &deployment.resource_id,
            deployment.operation,
            Arc::clone(registry),
            Arc::clone(store),
        )
    }

    fn deployment() -> Deployment {
        let resource = Resource::new("web-1", ProviderKind::Hetzner, "acct", "fsn1", "cx22", "ubuntu-24.04");
        Deployment::new(&resource.id, OperationType::Refresh, None, "ops")
    }

    fn persisted_seqs(deployment: &Deployment) -> Vec<u64> {
        deployment.logs.records.iter().map(|r| r.seq).collect()
    }

    #[tokio::test]
    async fn test_flush_persists_published_records() {
        let store: Arc<dyn DeploymentStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(LogBroadcastRegistry::new());
        let deployment = deployment();
        store.insert_deployment(&deployment).await.unwrap();

        let ctx = context(&store, &registry, &deployment);
        ctx.info("starting");
        ctx.sink().emit(LogRecord::warn("tool:refresh", "Warning: deprecated attribute"));
        ctx.flush().await;
        ctx.error("boom");
        ctx.flush().await;
        // 没有新记录时什么都不做
        ctx.flush().await;

        let stored = store.get_deployment(&deployment.id).await.unwrap();
        assert_eq!(persisted_seqs(&stored), vec![1, 2, 3]);
        assert_eq!(stored.logs.records[1].source, "tool:refresh");
        assert_eq!(registry.history(&deployment.id, 0).len(), 3);
        assert!(registry.pending(&deployment.id).is_empty());
    }

    #[tokio::test]
    async fn test_output_beyond_history_capacity_is_persisted_contiguously() {
        let store: Arc<dyn DeploymentStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(LogBroadcastRegistry::with_capacity(8));
        let deployment = deployment();
        store.insert_deployment(&deployment).await.unwrap();

        let workflow = context(&store, &registry, &deployment);
        let canceller = workflow.clone();

        // 两个上下文在发布过程中并发持久化
        let writer = {
            let ctx = workflow.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    ctx.info(format!("line {}", i));
                    if i % 25 == 0 {
                        ctx.flush().await;
                    }
                }
            })
        };
        let flusher = tokio::spawn(async move {
            for _ in 0..20 {
                canceller.flush().await;
                tokio::task::yield_now().await;
            }
        });
        writer.await.unwrap();
        flusher.await.unwrap();
        workflow.flush().await;

        let stored = store.get_deployment(&deployment.id).await.unwrap();
        assert_eq!(persisted_seqs(&stored), (1..=200).collect::<Vec<u64>>());
        assert_eq!(registry.history(&deployment.id, 0).len(), 8);
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried() {
        let store: Arc<dyn DeploymentStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(LogBroadcastRegistry::new());
        let deployment = deployment();

        let ctx = context(&store, &registry, &deployment);
        ctx.info("before the record exists");
        // 部署记录尚不存在，写入失败
        ctx.flush().await;
        assert_eq!(registry.pending(&deployment.id).len(), 1);

        store.insert_deployment(&deployment).await.unwrap();
        ctx.info("after");
        ctx.flush().await;

        let stored = store.get_deployment(&deployment.id).await.unwrap();
        assert_eq!(persisted_seqs(&stored), vec![1, 2]);
        assert!(registry.pending(&deployment.id).is_empty());
    }

    #[tokio::test]
    async fn test_periodic_flush_runs_until_stopped() {
        let store: Arc<dyn DeploymentStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(LogBroadcastRegistry::new());
        let deployment = deployment();
        store.insert_deployment(&deployment).await.unwrap();

        let ctx = context(&store, &registry, &deployment);
        let stop = ctx.spawn_periodic_flush(Duration::from_millis(20));
        ctx.info("while running");

        let mut persisted = 0;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            persisted = store.get_deployment(&deployment.id).await.unwrap().logs.records.len();
            if persisted == 1 {
                break;
            }
        }
        assert_eq!(persisted, 1);
        stop.cancel();
    }
}
