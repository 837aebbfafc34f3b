//! destroy 工作流：init → destroy；只有成功后才删除工作区

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::error::OrchestrationError;

use super::{OperationContext, Orchestrator, Transition};

pub(super) async fn run(orch: &Orchestrator, ctx: &OperationContext) -> Result<(), OrchestrationError> {
    orch.advance(ctx, Transition::Start).await?;

    let resource = orch.store.get_resource(&ctx.resource_id).await?;
    let creds = orch.credentials(ctx, &resource).await?;
    let mut runner = orch.prepare_runner(ctx, &resource, &creds).await?;
    orch.ensure_variables(ctx, &runner, &resource).await?;
    let sink = ctx.sink();

    let init = runner.init(Arc::clone(&sink)).await?;
    if !init.success {
        ctx.warn("Workspace retained for retry");
        return Err(OrchestrationError::DestroyFailed(
            init.error.unwrap_or_else(|| "init failed".to_string()),
        ));
    }

    let outcome = runner.destroy(Arc::clone(&sink)).await?;
    if !outcome.success {
        ctx.warn("Workspace retained for retry");
        return Err(OrchestrationError::DestroyFailed(
            outcome.error.unwrap_or_else(|| "destroy failed".to_string()),
        ));
    }

    // 仍持有租约时删除工作区
    match orch.workspaces.cleanup(runner.workspace_id()).await {
        Ok(()) => ctx.info(format!("Removed workspace {}", runner.workspace_id())),
        Err(e) => {
            warn!(deployment_id = %ctx.deployment_id, error = %e, "Failed to remove workspace");
            ctx.warn(format!("Failed to remove workspace: {}", e));
        }
    }
    drop(runner);

    orch.advance(ctx, Transition::Succeed { outputs: BTreeMap::new() }).await
}
