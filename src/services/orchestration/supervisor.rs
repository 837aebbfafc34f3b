//! 后台任务监督
//!
//! 每个部署的工作流在独立 tokio 任务中运行。监督者记录任务状态，
//! 任务 panic 时调用回调，由编排器把部署标记为失败。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info};

/// 任务状态
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Completed,
    Panicked,
}

/// 任务状态快照
#[derive(Clone, Debug, Serialize)]
pub struct TaskStatus {
    pub deployment_id: String,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// 任务监督者
#[derive(Default)]
pub struct TaskSupervisor {
    tasks: Mutex<HashMap<String, TaskStatus>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_state(&self, deployment_id: &str, state: TaskState) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(task) = tasks.get_mut(deployment_id) {
            task.state = state;
            task.finished_at = Some(Utc::now());
        }
    }

    /// 启动受监督的任务
    ///
    /// `on_panic` 收到 panic 信息，在独立任务中执行
    pub fn spawn<F, P, PF>(self: &Arc<Self>, deployment_id: &str, task: F, on_panic: P)
    where
        F: Future<Output = ()> + Send + 'static,
        P: FnOnce(String) -> PF + Send + 'static,
        PF: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).insert(
            deployment_id.to_string(),
            TaskStatus {
                deployment_id: deployment_id.to_string(),
                state: TaskState::Running,
                started_at: Utc::now(),
                finished_at: None,
            },
        );

        let handle = tokio::spawn(task);
        let supervisor = Arc::clone(self);
        let deployment_id = deployment_id.to_string();
        tokio::spawn(async move {
            match handle.await {
                Ok(()) => {
                    supervisor.set_state(&deployment_id, TaskState::Completed);
                }
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    error!(deployment_id = %deployment_id, panic = %message, "Deployment task panicked");
                    supervisor.set_state(&deployment_id, TaskState::Panicked);
                    on_panic(message).await;
                }
                Err(_) => {
                    // 运行时关闭时任务被取消
                    info!(deployment_id = %deployment_id, "Deployment task aborted");
                    supervisor.set_state(&deployment_id, TaskState::Completed);
                }
            }
        });
    }

    pub fn status(&self, deployment_id: &str) -> Option<TaskStatus> {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(deployment_id)
            .cloned()
    }

    /// 运行中的任务数
    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|t| t.state == TaskState::Running)
            .count()
    }

    /// 移除结束超过指定时长的任务记录
    pub fn cleanup_finished(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        let before = tasks.len();
        tasks.retain(|_, task| match task.finished_at {
            Some(finished_at) => now - finished_at < max_age,
            None => true,
        });
        before - tasks.len()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
