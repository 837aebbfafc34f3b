//! reboot 工作流：不经过 provisioning 工具，直接调用服务商 API 并轮询 action 状态

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::OrchestrationError;
use crate::infra::ActionStatus;

use super::{OperationContext, Orchestrator, Transition};

pub(super) async fn run(orch: &Orchestrator, ctx: &OperationContext) -> Result<(), OrchestrationError> {
    orch.advance(ctx, Transition::Start).await?;

    let resource = orch.store.get_resource(&ctx.resource_id).await?;
    let creds = orch.credentials(ctx, &resource).await?;
    let provider_resource_id = resource.provider_resource_id.clone().ok_or_else(|| {
        OrchestrationError::Conflict(format!("resource {} has no provider id", resource.id))
    })?;

    ctx.info(format!(
        "Requesting reboot of {} server {}",
        resource.provider.as_str(),
        provider_resource_id
    ));
    let action_id = orch
        .provider
        .reboot(resource.provider, &creds, &provider_resource_id)
        .await?;
    ctx.info(format!("Reboot action {} submitted", action_id));

    let policy = &orch.settings.reboot;
    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(policy.poll_interval).await;

        if orch.is_cancelled(ctx).await? {
            return Err(OrchestrationError::Cancelled);
        }

        match orch.provider.action_status(resource.provider, &creds, &action_id).await {
            Ok(ActionStatus::Completed) => {
                ctx.info(format!("Reboot action {} completed", action_id));
                let mut outputs = BTreeMap::new();
                outputs.insert("action_id".to_string(), action_id);
                return orch.advance(ctx, Transition::Succeed { outputs }).await;
            }
            Ok(ActionStatus::Errored(message)) => {
                return Err(OrchestrationError::Provider(message));
            }
            Ok(ActionStatus::InProgress) => {
                debug!(deployment_id = %ctx.deployment_id, action_id = %action_id, attempt, "Reboot in progress");
            }
            Err(e @ OrchestrationError::CredentialsInvalid(_)) => return Err(e),
            Err(e) => {
                warn!(deployment_id = %ctx.deployment_id, attempt, error = %e, "Reboot status check failed");
                ctx.warn(format!("Status check {} failed: {}", attempt, e));
            }
        }
    }

    Err(OrchestrationError::Timeout(format!(
        "reboot action {} did not complete after {} attempts",
        action_id, policy.max_attempts
    )))
}
