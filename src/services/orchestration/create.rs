//! create 工作流：init → plan → [审批] → apply → 同步资源

use std::sync::Arc;

use crate::domain::ProviderVariables;
use crate::error::OrchestrationError;

use super::{OperationContext, Orchestrator, Transition};

pub(super) async fn run(
    orch: &Orchestrator,
    ctx: &OperationContext,
    vars: ProviderVariables,
    requires_approval: bool,
) -> Result<(), OrchestrationError> {
    orch.advance(ctx, Transition::Start).await?;

    let resource = orch.store.get_resource(&ctx.resource_id).await?;
    let creds = orch.credentials(ctx, &resource).await?;
    let mut runner = orch.prepare_runner(ctx, &resource, &creds).await?;
    let sink = ctx.sink();

    let init = runner.init(Arc::clone(&sink)).await?;
    if !init.success {
        return Err(OrchestrationError::PlanFailed(
            init.error.unwrap_or_else(|| "init failed".to_string()),
        ));
    }

    let plan = runner.plan(&vars, Arc::clone(&sink)).await?;
    if !plan.success {
        return Err(OrchestrationError::PlanFailed(
            plan.error.unwrap_or_else(|| "plan failed".to_string()),
        ));
    }
    if let Some(summary) = &plan.summary {
        ctx.info(summary.clone());
    }

    // 先登记审批通道，再进入 awaiting_approval
    let approval = requires_approval.then(|| orch.register_approval(&ctx.deployment_id));
    orch.advance(ctx, Transition::PlanSucceeded { summary: plan.summary.clone() }).await?;

    if let Some(approval) = approval {
        ctx.info("Plan ready, waiting for approval");
        match tokio::time::timeout(orch.settings.approval_timeout, approval).await {
            Ok(Ok(())) => {}
            // 发送端被丢弃：部署已取消
            Ok(Err(_)) => return Err(OrchestrationError::Cancelled),
            Err(_) => {
                return Err(OrchestrationError::Timeout(format!(
                    "no approval within {}s",
                    orch.settings.approval_timeout.as_secs()
                )));
            }
        }
        orch.advance(ctx, Transition::Approve).await?;
        ctx.info("Plan approved");
    }

    let apply = match plan.plan_artifact.as_deref() {
        Some(artifact) => runner.apply(Some(artifact), Arc::clone(&sink)).await?,
        None => {
            ctx.warn("Plan artifact missing, applying from variables file");
            runner.apply(None, Arc::clone(&sink)).await?
        }
    };
    if !apply.success {
        return Err(OrchestrationError::ApplyFailed(
            apply.error.unwrap_or_else(|| "apply failed".to_string()),
        ));
    }

    if !apply.outputs.keys().any(|k| k == "ipv4_address" || k == "public_ipv4") {
        ctx.warn("Apply outputs contain no public address");
    }

    orch.advance(ctx, Transition::Succeed { outputs: apply.outputs }).await
}
