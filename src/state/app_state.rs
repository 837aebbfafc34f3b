//! 应用状态

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::env::constants::{LOG_CHANNEL_MAX_AGE_HOURS, LOG_CLEANUP_INTERVAL_SECS};
use crate::config::EnvConfig;
use crate::infra::{detect_tool, CredentialVault, HttpProviderClient, WorkspaceManager};
use crate::services::{Orchestrator, OrchestratorSettings};

use super::log_hub::LogBroadcastRegistry;
use super::store::{DeploymentStore, FileStore};

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 部署管理 ==========
    /// 部署与资源存储
    pub store: Arc<dyn DeploymentStore>,
    /// 日志广播中心
    pub registry: Arc<LogBroadcastRegistry>,
    /// 凭据库
    pub vault: Arc<CredentialVault>,
    /// 编排器
    pub orchestrator: Arc<Orchestrator>,

    /// 关闭信号，停止所有后台循环
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 按配置打开存储、凭据库与工作区，并构建编排器
    pub async fn open(config: EnvConfig) -> anyhow::Result<Self> {
        let store = FileStore::open(config.store_dir())
            .await
            .with_context(|| format!("failed to open store at {}", config.store_dir().display()))?;
        let vault = CredentialVault::open(&config.vault_identity_path(), config.vault_dir())
            .context("failed to open credential vault")?;
        let workspaces = WorkspaceManager::new(config.workspaces_dir(), config.modules_dir());
        let tool = detect_tool(&config.tool.binary);

        info!(
            api_key_len = config.api_key.len(),
            port = config.port,
            data_dir = %config.data_dir.display(),
            tool = %config.tool.binary,
            tool_available = tool.available(),
            modules_dir = %config.modules_dir().display(),
            "Loaded configuration"
        );

        let store: Arc<dyn DeploymentStore> = Arc::new(store);
        let registry = Arc::new(LogBroadcastRegistry::new());
        let vault = Arc::new(vault);
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::new(workspaces),
            Arc::clone(&vault),
            Arc::new(HttpProviderClient::new(config.provider_api.clone())),
            tool,
            OrchestratorSettings::from_config(&config),
        ));

        Ok(Self::from_parts(config, store, registry, vault, orchestrator))
    }

    pub fn from_parts(
        config: EnvConfig,
        store: Arc<dyn DeploymentStore>,
        registry: Arc<LogBroadcastRegistry>,
        vault: Arc<CredentialVault>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            api_key: config.api_key.clone(),
            config,
            started_at: Utc::now(),
            store,
            registry,
            vault,
            orchestrator,
            shutdown: CancellationToken::new(),
        }
    }

    /// 启动日志通道清理循环，收到关闭信号后退出
    pub fn spawn_log_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(LOG_CLEANUP_INTERVAL_SECS));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = state.shutdown.cancelled() => {
                        debug!("Log cleanup loop stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let finished = state.registry.cleanup();
                        let expired = state.registry.cleanup_expired(LOG_CHANNEL_MAX_AGE_HOURS);
                        let tasks = state
                            .orchestrator
                            .supervisor()
                            .cleanup_finished(chrono::Duration::hours(LOG_CHANNEL_MAX_AGE_HOURS));
                        let locks = state.orchestrator.sweep_locks();
                        if finished + expired + tasks + locks > 0 {
                            info!(finished, expired, tasks, locks, "Cleaned up log channels");
                        }
                    }
                }
            }
        })
    }

    /// 触发关闭
    pub fn trigger_shutdown(&self) {
        self.shutdown.cancel();
    }
}
