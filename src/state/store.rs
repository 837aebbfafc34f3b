//! 部署与资源记录存储
//!
//! `DeploymentStore` 是部署/资源状态的唯一可信来源。
//! - `FileStore`：每条记录一个 JSON 文件，临时文件 + rename 原子写入，重启后可恢复
//! - `MemoryStore`：测试用
//!
//! 日志历史只能通过 `append_logs` 写入；`update_deployment` 保留已存储的日志。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::domain::{Deployment, LogEnvelopeError, LogRecord, Resource};

/// 存储错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("invalid log history: {0}")]
    InvalidLogs(#[from] LogEnvelopeError),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 部署/资源存储
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<(), StoreError>;
    async fn get_deployment(&self, id: &str) -> Result<Deployment, StoreError>;
    /// 整行更新（日志历史除外）
    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), StoreError>;
    async fn list_deployments(&self) -> Result<Vec<Deployment>, StoreError>;

    async fn insert_resource(&self, resource: &Resource) -> Result<(), StoreError>;
    async fn get_resource(&self, id: &str) -> Result<Resource, StoreError>;
    async fn update_resource(&self, resource: &Resource) -> Result<(), StoreError>;

    /// 追加日志历史，写入前按信封规则校验，返回实际追加条数
    async fn append_logs(&self, deployment_id: &str, records: &[LogRecord]) -> Result<usize, StoreError>;
}

fn deployment_key(id: &str) -> String {
    format!("deployment {}", id)
}

fn resource_key(id: &str) -> String {
    format!("resource {}", id)
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    deployments: RwLock<HashMap<String, Deployment>>,
    resources: RwLock<HashMap<String, Resource>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let mut deployments = self.deployments.write().await;
        if deployments.contains_key(&deployment.id) {
            return Err(StoreError::Conflict(deployment_key(&deployment.id)));
        }
        deployments.insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, id: &str) -> Result<Deployment, StoreError> {
        self.deployments
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(deployment_key(id)))
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let mut deployments = self.deployments.write().await;
        let existing = deployments
            .get_mut(&deployment.id)
            .ok_or_else(|| StoreError::NotFound(deployment_key(&deployment.id)))?;
        let logs = std::mem::take(&mut existing.logs);
        *existing = deployment.clone();
        existing.logs = logs;
        Ok(())
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>, StoreError> {
        Ok(self.deployments.read().await.values().cloned().collect())
    }

    async fn insert_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let mut resources = self.resources.write().await;
        if resources.contains_key(&resource.id) {
            return Err(StoreError::Conflict(resource_key(&resource.id)));
        }
        resources.insert(resource.id.clone(), resource.clone());
        Ok(())
    }

    async fn get_resource(&self, id: &str) -> Result<Resource, StoreError> {
        self.resources
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(resource_key(id)))
    }

    async fn update_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let mut resources = self.resources.write().await;
        let existing = resources
            .get_mut(&resource.id)
            .ok_or_else(|| StoreError::NotFound(resource_key(&resource.id)))?;
        *existing = resource.clone();
        Ok(())
    }

    async fn append_logs(&self, deployment_id: &str, records: &[LogRecord]) -> Result<usize, StoreError> {
        let mut deployments = self.deployments.write().await;
        let deployment = deployments
            .get_mut(deployment_id)
            .ok_or_else(|| StoreError::NotFound(deployment_key(deployment_id)))?;
        Ok(deployment.logs.append(records)?)
    }
}

/// 文件存储
///
/// 目录布局：`<root>/deployments/<id>.json`、`<root>/resources/<id>.json`
pub struct FileStore {
    root: PathBuf,
    /// 串行化读-改-写
    write_lock: Mutex<()>,
}

impl FileStore {
    /// 打开存储目录（不存在时创建）
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("deployments")).await?;
        fs::create_dir_all(root.join("resources")).await?;
        info!(path = %root.display(), "Opened deployment store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn deployment_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        record_path(&self.root.join("deployments"), id, deployment_key)
    }

    fn resource_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        record_path(&self.root.join("resources"), id, resource_key)
    }
}

/// 记录 ID 只允许安全字符，避免路径穿越
fn record_path(dir: &Path, id: &str, key: fn(&str) -> String) -> Result<PathBuf, StoreError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(StoreError::NotFound(key(id)));
    }
    Ok(dir.join(format!("{}.json", id)))
}

async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.display().to_string(),
                source,
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// 原子写入：先写临时文件再重命名
async fn write_record<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let temp_path = path.with_extension("json.tmp");
    let content = serde_json::to_vec_pretty(value)?;
    fs::write(&temp_path, &content).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[async_trait]
impl DeploymentStore for FileStore {
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let path = self.deployment_path(&deployment.id)?;
        let _guard = self.write_lock.lock().await;
        if fs::try_exists(&path).await? {
            return Err(StoreError::Conflict(deployment_key(&deployment.id)));
        }
        write_record(&path, deployment).await
    }

    async fn get_deployment(&self, id: &str) -> Result<Deployment, StoreError> {
        let path = self.deployment_path(id)?;
        read_record(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(deployment_key(id)))
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let path = self.deployment_path(&deployment.id)?;
        let _guard = self.write_lock.lock().await;
        let existing: Deployment = read_record(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(deployment_key(&deployment.id)))?;
        let mut updated = deployment.clone();
        updated.logs = existing.logs;
        write_record(&path, &updated).await
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>, StoreError> {
        let mut deployments = Vec::new();
        let mut entries = fs::read_dir(self.root.join("deployments")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record::<Deployment>(&path).await {
                Ok(Some(deployment)) => deployments.push(deployment),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable deployment record");
                }
            }
        }
        Ok(deployments)
    }

    async fn insert_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let path = self.resource_path(&resource.id)?;
        let _guard = self.write_lock.lock().await;
        if fs::try_exists(&path).await? {
            return Err(StoreError::Conflict(resource_key(&resource.id)));
        }
        write_record(&path, resource).await
    }

    async fn get_resource(&self, id: &str) -> Result<Resource, StoreError> {
        let path = self.resource_path(id)?;
        read_record(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(resource_key(id)))
    }

    async fn update_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let path = self.resource_path(&resource.id)?;
        let _guard = self.write_lock.lock().await;
        if !fs::try_exists(&path).await? {
            return Err(StoreError::NotFound(resource_key(&resource.id)));
        }
        write_record(&path, resource).await
    }

    async fn append_logs(&self, deployment_id: &str, records: &[LogRecord]) -> Result<usize, StoreError> {
        let path = self.deployment_path(deployment_id)?;
        let _guard = self.write_lock.lock().await;
        let mut deployment: Deployment = read_record(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(deployment_key(deployment_id)))?;
        let appended = deployment.logs.append(records)?;
        if appended > 0 {
            write_record(&path, &deployment).await?;
        }
        Ok(appended)
    }
}
