//! 部署状态机
//!
//! 定义合法的状态转换以及每次转换对资源记录的副作用。
//!
//! ```text
//! create:                queued → planning → [awaiting_approval →] applying → succeeded | failed
//! reboot/destroy/refresh: queued → applying → succeeded | failed
//! 任意非终态 → cancelled
//! ```
//!
//! 终态部署上的任何转换都是 no-op。已销毁的资源不再受任何转换影响。

use std::collections::BTreeMap;

use chrono::Utc;

use crate::domain::{Deployment, DeploymentState, OperationType, Resource, ResourceStatus};
use crate::error::OrchestrationError;

/// 状态转换事件
#[derive(Clone, Debug)]
pub enum Transition {
    /// 开始执行（queued → planning / applying）
    Start,
    /// plan 成功（planning → awaiting_approval / applying）
    PlanSucceeded { summary: Option<String> },
    /// 人工审批通过（awaiting_approval → applying）
    Approve,
    /// apply 成功并已解析输出（applying → succeeded）
    Succeed { outputs: BTreeMap<String, String> },
    /// 任意非终态 → failed
    Fail { error: String },
    /// 任意非终态 → cancelled
    Cancel,
}

impl Transition {
    fn action(&self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::PlanSucceeded { .. } => "complete plan for",
            Transition::Approve => "approve",
            Transition::Succeed { .. } => "complete",
            Transition::Fail { .. } => "fail",
            Transition::Cancel => "cancel",
        }
    }
}

/// 转换结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        from: DeploymentState,
        to: DeploymentState,
    },
    /// 部署已是终态，未做任何修改
    Ignored,
}

/// 应用一次状态转换
///
/// 非法转换返回 `InvalidTransition` 且不修改任何记录
pub fn apply(
    deployment: &mut Deployment,
    resource: &mut Resource,
    transition: Transition,
) -> Result<TransitionOutcome, OrchestrationError> {
    let from = deployment.state;
    if from.is_terminal() {
        return Ok(TransitionOutcome::Ignored);
    }

    let to = next_state(deployment, &transition).ok_or(OrchestrationError::InvalidTransition {
        from,
        action: transition.action(),
    })?;
    debug_assert!(to.rank() >= from.rank());

    let now = Utc::now();
    // 资源已销毁时只推进部署本身
    let mut scratch;
    let resource = if resource.actual_status == ResourceStatus::Destroyed {
        scratch = resource.clone();
        &mut scratch
    } else {
        resource
    };
    match transition {
        Transition::Start => {
            deployment.started_at = Some(now);
            let (actual, desired) = match deployment.operation {
                OperationType::Create => (ResourceStatus::Provisioning, Some(ResourceStatus::Running)),
                OperationType::Reboot => (ResourceStatus::Rebooting, Some(ResourceStatus::Running)),
                OperationType::Destroy => (ResourceStatus::Destroying, Some(ResourceStatus::Destroyed)),
                OperationType::Refresh => (ResourceStatus::Refreshing, None),
            };
            resource.actual_status = actual;
            if let Some(desired) = desired {
                resource.desired_status = desired;
            }
            resource.updated_at = now;
        }
        Transition::PlanSucceeded { summary } => {
            deployment.plan_summary = summary;
        }
        Transition::Approve => {}
        Transition::Succeed { outputs } => {
            sync_resource(resource, deployment.operation, &outputs);
            resource.updated_at = now;
            deployment.outputs = outputs;
        }
        Transition::Fail { error } => {
            deployment.set_error(&error);
            resource.actual_status = ResourceStatus::Error;
            resource.updated_at = now;
        }
        Transition::Cancel => {
            // 已开始执行的操作无法确认资源实际状态
            if from != DeploymentState::Queued {
                resource.actual_status = ResourceStatus::Unknown;
                resource.updated_at = now;
            }
        }
    }

    deployment.state = to;
    if to.is_terminal() {
        deployment.finished_at = Some(now);
    }

    Ok(TransitionOutcome::Applied { from, to })
}

fn next_state(deployment: &Deployment, transition: &Transition) -> Option<DeploymentState> {
    use DeploymentState::*;

    match (deployment.state, transition) {
        (Queued, Transition::Start) => Some(if deployment.operation.uses_plan() {
            Planning
        } else {
            Applying
        }),
        (Planning, Transition::PlanSucceeded { .. }) => Some(if deployment.requires_approval {
            AwaitingApproval
        } else {
            Applying
        }),
        (AwaitingApproval, Transition::Approve) => Some(Applying),
        (Applying, Transition::Succeed { .. }) => Some(Succeeded),
        (_, Transition::Fail { .. }) => Some(Failed),
        (_, Transition::Cancel) => Some(Cancelled),
        _ => None,
    }
}

/// 按 apply 输出同步资源
fn sync_resource(resource: &mut Resource, operation: OperationType, outputs: &BTreeMap<String, String>) {
    let pick = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| outputs.get(*k))
            .find(|v| !v.is_empty())
            .cloned()
    };

    if let Some(id) = pick(&["id", "resource_id", "droplet_id", "server_id"]) {
        resource.provider_resource_id = Some(id);
    }
    if let Some(ip) = pick(&["ipv4_address", "public_ipv4"]) {
        resource.addresses.public_ipv4 = Some(ip);
    }
    if let Some(ip) = pick(&["ipv4_address_private", "private_ipv4"]) {
        resource.addresses.private_ipv4 = Some(ip);
    }
    if let Some(ip) = pick(&["ipv6_address", "public_ipv6"]) {
        resource.addresses.public_ipv6 = Some(ip);
    }

    resource.actual_status = match operation {
        OperationType::Destroy => ResourceStatus::Destroyed,
        _ => ResourceStatus::Running,
    };
}
