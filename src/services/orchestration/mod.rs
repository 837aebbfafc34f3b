//! 部署编排
//!
//! `Orchestrator` 接收 create / reboot / destroy / refresh 请求，立即返回待执行的
//! 部署记录，然后在受监督的后台任务中驱动工作区与工具执行器完成操作。
//!
//! - 每个资源的记录读改写在资源锁内串行，状态机决定转换是否合法
//! - 同一工作区上的工具子命令由工作区租约串行
//! - 所有错误在操作边界被捕获并记录到部署与资源上

mod context;
mod create;
mod destroy;
mod reboot;
mod refresh;
pub mod state_machine;
pub mod supervisor;


use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::env::constants::LOG_FLUSH_INTERVAL_MS;
use crate::config::{EnvConfig, RebootPolicy};
use crate::domain::{
    BootstrapProfile, Deployment, DeploymentState, FirewallProfile, LogRecord, OperationType,
    ProviderKind, ProviderVariables, Resource, ResourceStatus, TranslationInput,
};
use crate::error::OrchestrationError;
use crate::infra::workspace::VARIABLES_FILE;
use crate::infra::{CredentialBundle, CredentialVault, ProviderControl, ProvisioningRunner, ToolStatus, WorkspaceManager};
use crate::state::log_hub::LogBroadcastRegistry;
use crate::state::store::DeploymentStore;

pub use context::OperationContext;
pub use state_machine::{Transition, TransitionOutcome};
pub use supervisor::{TaskState, TaskStatus, TaskSupervisor};

/// 创建资源请求
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    pub provider: ProviderKind,
    pub account_id: String,
    pub region: String,
    pub size: String,
    pub image: String,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub firewall: Option<FirewallProfile>,
    #[serde(default)]
    pub bootstrap: Option<BootstrapProfile>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default = "default_initiator")]
    pub initiator: String,
}

fn default_initiator() -> String {
    "api".to_string()
}

/// 编排参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub command_timeout: Duration,
    pub reboot: RebootPolicy,
    pub approval_timeout: Duration,
    pub callback_url: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &EnvConfig) -> Self {
        Self {
            command_timeout: config.tool.command_timeout,
            reboot: config.reboot.clone(),
            approval_timeout: config.approval_timeout,
            callback_url: config.callback_url.clone(),
        }
    }
}

/// 后台工作流
enum Workflow {
    Create {
        vars: ProviderVariables,
        requires_approval: bool,
    },
    Reboot,
    Destroy,
    Refresh,
}

/// 部署编排器
pub struct Orchestrator {
    store: Arc<dyn DeploymentStore>,
    registry: Arc<LogBroadcastRegistry>,
    workspaces: Arc<WorkspaceManager>,
    vault: Arc<CredentialVault>,
    provider: Arc<dyn ProviderControl>,
    tool: ToolStatus,
    settings: OrchestratorSettings,
    supervisor: Arc<TaskSupervisor>,
    /// 资源记录锁 (resource_id -> lock)
    resource_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// 等待审批的部署 (deployment_id -> sender)
    approvals: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        registry: Arc<LogBroadcastRegistry>,
        workspaces: Arc<WorkspaceManager>,
        vault: Arc<CredentialVault>,
        provider: Arc<dyn ProviderControl>,
        tool: ToolStatus,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            registry,
            workspaces,
            vault,
            provider,
            tool,
            settings,
            supervisor: Arc::new(TaskSupervisor::new()),
            resource_locks: Mutex::new(HashMap::new()),
            approvals: Mutex::new(HashMap::new()),
        }
    }

    pub fn tool(&self) -> &ToolStatus {
        &self.tool
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    // ========== 操作入口 ==========

    /// 创建资源
    ///
    /// 变量在请求内翻译并校验，非法输入不会产生任何记录
    pub async fn create(self: &Arc<Self>, request: CreateRequest) -> Result<(Deployment, Resource), OrchestrationError> {
        self.require_tool()?;

        let mut resource = Resource::new(
            request.name,
            request.provider,
            request.account_id,
            request.region,
            request.size,
            request.image,
        );
        resource.ssh_keys = request.ssh_keys;
        resource.firewall_profile_id = request.firewall.as_ref().map(|f| f.id.clone());
        resource.bootstrap_profile_id = request.bootstrap.as_ref().map(|b| b.id.clone());

        let vars = ProviderVariables::translate(&TranslationInput {
            resource: &resource,
            firewall: request.firewall.as_ref(),
            bootstrap: request.bootstrap.as_ref(),
            callback_url: &self.settings.callback_url,
        })?;

        let deployment = Deployment::new(
            &resource.id,
            OperationType::Create,
            Some(resource.workspace_id.clone()),
            request.initiator,
        )
        .with_approval(request.requires_approval);

        self.store.insert_resource(&resource).await?;
        self.store.insert_deployment(&deployment).await?;

        info!(
            deployment_id = %deployment.id,
            resource_id = %resource.id,
            provider = %resource.provider.as_str(),
            requires_approval = deployment.requires_approval,
            "Create requested"
        );

        self.launch(
            &deployment,
            Workflow::Create {
                vars,
                requires_approval: request.requires_approval,
            },
        );
        Ok((deployment, resource))
    }

    pub async fn reboot(self: &Arc<Self>, resource_id: &str, initiator: &str) -> Result<Deployment, OrchestrationError> {
        self.start_operation(resource_id, OperationType::Reboot, initiator).await
    }

    pub async fn destroy(self: &Arc<Self>, resource_id: &str, initiator: &str) -> Result<Deployment, OrchestrationError> {
        self.start_operation(resource_id, OperationType::Destroy, initiator).await
    }

    pub async fn refresh(self: &Arc<Self>, resource_id: &str, initiator: &str) -> Result<Deployment, OrchestrationError> {
        self.start_operation(resource_id, OperationType::Refresh, initiator).await
    }

    async fn start_operation(
        self: &Arc<Self>,
        resource_id: &str,
        operation: OperationType,
        initiator: &str,
    ) -> Result<Deployment, OrchestrationError> {
        // 与状态转换共用资源锁，检查与插入之间不会有销毁完成或开始
        let lock = self.resource_lock(resource_id);
        let _guard = lock.lock().await;

        let resource = self.store.get_resource(resource_id).await?;
        if resource.actual_status == ResourceStatus::Destroyed {
            return Err(OrchestrationError::Conflict(format!(
                "resource {} is already destroyed",
                resource.id
            )));
        }
        if let Some(pending) = self.pending_destroy(&resource.id).await? {
            return Err(OrchestrationError::Conflict(format!(
                "resource {} is being destroyed by deployment {}",
                resource.id, pending
            )));
        }

        let (workspace_id, workflow) = match operation {
            OperationType::Reboot => {
                if resource.provider_resource_id.is_none() {
                    return Err(OrchestrationError::Conflict(format!(
                        "resource {} has no provider id yet",
                        resource.id
                    )));
                }
                (None, Workflow::Reboot)
            }
            OperationType::Destroy => {
                self.require_tool()?;
                (Some(resource.workspace_id.clone()), Workflow::Destroy)
            }
            OperationType::Refresh => {
                self.require_tool()?;
                (Some(resource.workspace_id.clone()), Workflow::Refresh)
            }
            OperationType::Create => {
                return Err(OrchestrationError::Conflict("create requires a create request".to_string()));
            }
        };

        let deployment = Deployment::new(&resource.id, operation, workspace_id, initiator);
        self.store.insert_deployment(&deployment).await?;

        info!(
            deployment_id = %deployment.id,
            resource_id = %resource.id,
            operation = %operation.as_str(),
            "Operation requested"
        );

        self.launch(&deployment, workflow);
        Ok(deployment)
    }

    /// 取消部署
    ///
    /// 只修改持久化状态，不终止正在运行的子进程；工作流在下一次转换时发现终态后停止
    pub async fn cancel(&self, deployment_id: &str) -> Result<Deployment, OrchestrationError> {
        let deployment = self.store.get_deployment(deployment_id).await?;
        let ctx = self.context(&deployment);

        if self.transition(&ctx, Transition::Cancel).await? == TransitionOutcome::Ignored {
            let current = self.store.get_deployment(deployment_id).await?;
            return Err(OrchestrationError::InvalidTransition {
                from: current.state,
                action: "cancel",
            });
        }

        // 唤醒等待审批的工作流
        self.approvals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(deployment_id);

        ctx.warn("Cancellation requested");
        ctx.flush().await;
        info!(deployment_id = %deployment_id, "Deployment cancelled");

        Ok(self.store.get_deployment(deployment_id).await?)
    }

    /// 审批通过等待中的部署
    pub async fn approve(&self, deployment_id: &str) -> Result<Deployment, OrchestrationError> {
        let deployment = self.store.get_deployment(deployment_id).await?;
        if deployment.state != DeploymentState::AwaitingApproval {
            return Err(OrchestrationError::InvalidTransition {
                from: deployment.state,
                action: "approve",
            });
        }

        let sender = self
            .approvals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(deployment_id)
            .ok_or_else(|| {
                OrchestrationError::Conflict(format!("deployment {} has no pending approval", deployment_id))
            })?;
        sender.send(()).map_err(|_| {
            OrchestrationError::Conflict(format!("deployment {} is no longer waiting", deployment_id))
        })?;

        info!(deployment_id = %deployment_id, "Deployment approved");
        Ok(deployment)
    }

    /// 启动时修复被中断的部署
    ///
    /// 上次运行遗留的非终态部署标记为失败，返回处理数量
    pub async fn reconcile(&self) -> Result<usize, OrchestrationError> {
        const REASON: &str = "interrupted by agent restart";

        let mut reconciled = 0;
        for deployment in self.store.list_deployments().await? {
            if deployment.state.is_terminal() {
                continue;
            }

            self.registry.resume(&deployment.id, deployment.logs.last_seq());
            let ctx = self.context(&deployment);
            ctx.warn(REASON);

            match self.transition(&ctx, Transition::Fail { error: REASON.to_string() }).await {
                Ok(TransitionOutcome::Applied { from, .. }) => {
                    warn!(deployment_id = %deployment.id, state = %from, "Marked interrupted deployment as failed");
                    reconciled += 1;
                }
                Ok(TransitionOutcome::Ignored) => {}
                Err(e) => {
                    error!(deployment_id = %deployment.id, error = %e, "Failed to reconcile deployment");
                }
            }
            self.close(&ctx).await;
        }

        if reconciled > 0 {
            info!(count = reconciled, "Reconciled interrupted deployments");
        }
        Ok(reconciled)
    }

    // ========== 查询 ==========

    pub async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment, OrchestrationError> {
        Ok(self.store.get_deployment(deployment_id).await?)
    }

    pub async fn get_resource(&self, resource_id: &str) -> Result<Resource, OrchestrationError> {
        Ok(self.store.get_resource(resource_id).await?)
    }

    /// 日志快照：已持久化的历史加上广播中心中尚未确认和更新的记录
    ///
    /// 先读广播中心再读存储：读取之前发布的记录要么仍未确认，要么已经落盘
    pub async fn logs_snapshot(&self, deployment_id: &str) -> Result<Vec<LogRecord>, OrchestrationError> {
        let pending = self.registry.pending(deployment_id);
        let history = self.registry.history(deployment_id, 0);
        let deployment = self.store.get_deployment(deployment_id).await?;

        let mut merged: BTreeMap<u64, LogRecord> = BTreeMap::new();
        for record in deployment.logs.records.into_iter().chain(pending).chain(history) {
            merged.entry(record.seq).or_insert(record);
        }
        Ok(merged.into_values().collect())
    }

    /// 移除空闲的资源锁与工作区锁，返回移除数量
    pub fn sweep_locks(&self) -> usize {
        let resources = {
            let mut locks = self.resource_locks.lock().unwrap_or_else(|p| p.into_inner());
            let before = locks.len();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            before - locks.len()
        };
        resources + self.workspaces.sweep_locks()
    }

    pub fn task_status(&self, deployment_id: &str) -> Option<TaskStatus> {
        self.supervisor.status(deployment_id)
    }

    // ========== 工作流支撑 ==========

    fn context(&self, deployment: &Deployment) -> OperationContext {
        OperationContext::new(
            &deployment.id,
            &deployment.resource_id,
            deployment.operation,
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
        )
    }

    /// 资源上尚未结束的 destroy 部署
    async fn pending_destroy(&self, resource_id: &str) -> Result<Option<String>, OrchestrationError> {
        Ok(self
            .store
            .list_deployments()
            .await?
            .into_iter()
            .find(|d| {
                d.resource_id == resource_id
                    && d.operation == OperationType::Destroy
                    && !d.state.is_terminal()
            })
            .map(|d| d.id))
    }

    fn require_tool(&self) -> Result<(), OrchestrationError> {
        if self.tool.available() {
            Ok(())
        } else {
            Err(OrchestrationError::ToolUnavailable(self.tool.binary.clone()))
        }
    }

    fn resource_lock(&self, resource_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.resource_locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(resource_id.to_string()).or_default())
    }

    /// 在后台任务中运行工作流
    fn launch(self: &Arc<Self>, deployment: &Deployment, workflow: Workflow) {
        self.registry.create(&deployment.id);
        let ctx = self.context(deployment);

        let this = Arc::clone(self);
        let task_ctx = ctx.clone();
        let panic_this = Arc::clone(self);
        let panic_ctx = ctx;

        self.supervisor.spawn(
            &deployment.id,
            async move {
                // 长时间运行的子进程输出不会只停留在有界历史中
                let _periodic_flush = task_ctx
                    .spawn_periodic_flush(Duration::from_millis(LOG_FLUSH_INTERVAL_MS))
                    .drop_guard();
                let result = this.run_workflow(&task_ctx, workflow).await;
                this.conclude(&task_ctx, result).await;
            },
            move |message| async move {
                panic_this
                    .record_failure(&panic_ctx, &format!("internal error: {}", message))
                    .await;
                panic_this.close(&panic_ctx).await;
            },
        );
    }

    async fn run_workflow(&self, ctx: &OperationContext, workflow: Workflow) -> Result<(), OrchestrationError> {
        match workflow {
            Workflow::Create { vars, requires_approval } => create::run(self, ctx, vars, requires_approval).await,
            Workflow::Reboot => reboot::run(self, ctx).await,
            Workflow::Destroy => destroy::run(self, ctx).await,
            Workflow::Refresh => refresh::run(self, ctx).await,
        }
    }

    /// 操作边界：记录结果并关闭日志通道
    async fn conclude(&self, ctx: &OperationContext, result: Result<(), OrchestrationError>) {
        match result {
            Ok(()) => {
                info!(
                    deployment_id = %ctx.deployment_id,
                    operation = %ctx.operation.as_str(),
                    "Deployment succeeded"
                );
            }
            Err(OrchestrationError::Cancelled) => {
                info!(deployment_id = %ctx.deployment_id, "Workflow stopped after cancellation");
                ctx.info("Workflow stopped after cancellation");
            }
            Err(e) => self.record_failure(ctx, &e.to_string()).await,
        }
        self.close(ctx).await;
    }

    async fn record_failure(&self, ctx: &OperationContext, message: &str) {
        error!(
            deployment_id = %ctx.deployment_id,
            operation = %ctx.operation.as_str(),
            error = %message,
            "Deployment failed"
        );
        ctx.error(message);
        if let Err(e) = self
            .transition(ctx, Transition::Fail { error: message.to_string() })
            .await
        {
            error!(deployment_id = %ctx.deployment_id, error = %e, "Failed to record deployment failure");
        }
    }

    async fn close(&self, ctx: &OperationContext) {
        self.approvals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&ctx.deployment_id);
        ctx.flush().await;
        self.registry.finish(&ctx.deployment_id);
    }

    /// 在资源锁内读取、转换并写回部署与资源
    async fn transition(&self, ctx: &OperationContext, transition: Transition) -> Result<TransitionOutcome, OrchestrationError> {
        let lock = self.resource_lock(&ctx.resource_id);
        let outcome = {
            let _guard = lock.lock().await;
            let mut deployment = self.store.get_deployment(&ctx.deployment_id).await?;
            let mut resource = self.store.get_resource(&ctx.resource_id).await?;

            let outcome = state_machine::apply(&mut deployment, &mut resource, transition)?;
            if let TransitionOutcome::Applied { .. } = outcome {
                self.store.update_resource(&resource).await?;
                self.store.update_deployment(&deployment).await?;
            }
            outcome
        };

        if let TransitionOutcome::Applied { from, to } = outcome {
            info!(deployment_id = %ctx.deployment_id, from = %from, to = %to, "Deployment state changed");
            ctx.info(format!("State: {} -> {}", from, to));
        }
        ctx.flush().await;
        Ok(outcome)
    }

    /// 推进工作流；部署已被取消时返回 `Cancelled`
    async fn advance(&self, ctx: &OperationContext, transition: Transition) -> Result<(), OrchestrationError> {
        match self.transition(ctx, transition).await? {
            TransitionOutcome::Applied { .. } => Ok(()),
            TransitionOutcome::Ignored => Err(OrchestrationError::Cancelled),
        }
    }

    fn register_approval(&self, deployment_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.approvals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(deployment_id.to_string(), tx);
        rx
    }

    /// 部署是否已被外部置为终态
    async fn is_cancelled(&self, ctx: &OperationContext) -> Result<bool, OrchestrationError> {
        Ok(self.store.get_deployment(&ctx.deployment_id).await?.state.is_terminal())
    }

    /// 读取账户凭据，在任何子进程启动前校验
    async fn credentials(&self, ctx: &OperationContext, resource: &Resource) -> Result<CredentialBundle, OrchestrationError> {
        let creds = self
            .vault
            .get(&resource.account_id)
            .await
            .ok_or_else(|| OrchestrationError::CredentialsNotFound(resource.account_id.clone()))?;
        if creds.api_token.trim().is_empty() {
            return Err(OrchestrationError::CredentialsInvalid(format!(
                "empty api token for account '{}'",
                resource.account_id
            )));
        }
        ctx.info(format!("Loaded credentials for account {}", resource.account_id));
        Ok(creds)
    }

    /// 获取工作区租约、安装模块并构建执行器
    async fn prepare_runner(
        &self,
        ctx: &OperationContext,
        resource: &Resource,
        creds: &CredentialBundle,
    ) -> Result<ProvisioningRunner, OrchestrationError> {
        let workspace_id = &resource.workspace_id;
        let lease = self.workspaces.acquire(workspace_id).await?;
        ctx.info(format!("Acquired workspace {}", workspace_id));

        // 等待租约期间资源可能已被销毁，不能重建其工作区
        if self.store.get_resource(&resource.id).await?.actual_status == ResourceStatus::Destroyed {
            return Err(OrchestrationError::Conflict(format!(
                "resource {} was destroyed while waiting for its workspace",
                resource.id
            )));
        }

        let module = resource.provider.module_name();
        let files = self.workspaces.install_module(workspace_id, module).await?;
        ctx.info(format!("Installed module {} ({} files)", module, files));

        Ok(ProvisioningRunner::new(&self.tool, lease, self.settings.command_timeout)?
            .with_credentials(resource.provider.token_env_vars(), creds))
    }

    /// 工作区缺少变量文件时按资源记录重新生成
    ///
    /// 防火墙和引导配置只在创建请求中提供，重新生成的变量不包含它们
    async fn ensure_variables(&self, ctx: &OperationContext, runner: &ProvisioningRunner, resource: &Resource) -> Result<(), OrchestrationError> {
        if tokio::fs::try_exists(runner.dir().join(VARIABLES_FILE))
            .await
            .unwrap_or(false)
        {
            return Ok(());
        }

        let vars = ProviderVariables::translate(&TranslationInput {
            resource,
            firewall: None,
            bootstrap: None,
            callback_url: &self.settings.callback_url,
        })?;
        self.workspaces.write_variables(runner.workspace_id(), &vars).await?;
        ctx.warn("Variables file missing, regenerated from resource record");
        Ok(())
    }
}
