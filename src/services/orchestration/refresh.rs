//! refresh 工作流：init → refresh → output，然后按输出同步资源

use std::sync::Arc;

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
        return Err(OrchestrationError::ApplyFailed(
            init.error.unwrap_or_else(|| "init failed".to_string()),
        ));
    }

    let outcome = runner.refresh(Arc::clone(&sink)).await?;
    if !outcome.success {
        return Err(OrchestrationError::ApplyFailed(
            outcome.error.unwrap_or_else(|| "refresh failed".to_string()),
        ));
    }
    ctx.info(format!("Refreshed {} outputs", outcome.outputs.len()));

    orch.advance(ctx, Transition::Succeed { outputs: outcome.outputs }).await
}
