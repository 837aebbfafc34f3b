//! 工作区管理
//!
//! 每个资源一个独立工作目录，包含模块模板副本、变量文件和 plan 产物。
//! `acquire` 返回独占租约，同一工作区同一时刻只有一个持有者。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::OrchestrationError;
use crate::domain::ProviderVariables;

/// 变量文件名
pub const VARIABLES_FILE: &str = "terraform.tfvars.json";

/// plan 产物文件名
pub const PLAN_FILE: &str = "tfplan";

/// 工作区管理器
pub struct WorkspaceManager {
    root: PathBuf,
    modules_dir: PathBuf,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// 工作区独占租约，drop 时释放
pub struct WorkspaceLease {
    workspace_id: String,
    dir: PathBuf,
    _guard: OwnedMutexGuard<()>,
}

impl WorkspaceLease {
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            modules_dir: modules_dir.into(),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// 工作区目录路径
    pub fn path(&self, workspace_id: &str) -> Result<PathBuf, OrchestrationError> {
        validate_id(workspace_id)?;
        Ok(self.root.join(workspace_id))
    }

    /// 获取工作区独占租约
    pub async fn acquire(&self, workspace_id: &str) -> Result<WorkspaceLease, OrchestrationError> {
        let dir = self.path(workspace_id)?;
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(workspace_id.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        debug!(workspace_id = %workspace_id, "Acquired workspace lease");
        Ok(WorkspaceLease {
            workspace_id: workspace_id.to_string(),
            dir,
            _guard: guard,
        })
    }

    /// 幂等创建工作区目录
    pub async fn ensure(&self, workspace_id: &str) -> Result<PathBuf, OrchestrationError> {
        let dir = self.path(workspace_id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| OrchestrationError::workspace_io(&dir, e))?;
        Ok(dir)
    }

    /// 复制模块模板文件到工作区
    pub async fn install_module(&self, workspace_id: &str, module_name: &str) -> Result<usize, OrchestrationError> {
        validate_id(module_name).map_err(|_| OrchestrationError::ModuleNotFound(module_name.to_string()))?;
        let source = self.modules_dir.join(module_name);
        if !fs::try_exists(&source).await.unwrap_or(false) {
            return Err(OrchestrationError::ModuleNotFound(module_name.to_string()));
        }

        let dest = self.ensure(workspace_id).await?;
        let copied = copy_dir(&source, &dest).await?;
        info!(
            workspace_id = %workspace_id,
            module = %module_name,
            files = copied,
            "Installed provisioning module"
        );
        Ok(copied)
    }

    /// 写入变量文件
    pub async fn write_variables(&self, workspace_id: &str, vars: &ProviderVariables) -> Result<PathBuf, OrchestrationError> {
        let dir = self.ensure(workspace_id).await?;
        write_variables_file(&dir, vars).await
    }

    /// 删除工作区（仅在确认 destroy 成功后调用）
    pub async fn cleanup(&self, workspace_id: &str) -> Result<(), OrchestrationError> {
        let dir = self.path(workspace_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(workspace_id = %workspace_id, "Removed workspace");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(OrchestrationError::workspace_io(&dir, e)),
        }
        Ok(())
    }

    /// 移除没有租约持有者或等待者的锁，返回移除数量
    ///
    /// `acquire` 在映射锁内克隆锁，引用计数为 1 的条目不会被任何人使用
    pub fn sweep_locks(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub async fn exists(&self, workspace_id: &str) -> bool {
        match self.path(workspace_id) {
            Ok(dir) => fs::try_exists(&dir).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// 在工作区目录中原子写入变量文件
pub async fn write_variables_file(dir: &Path, vars: &ProviderVariables) -> Result<PathBuf, OrchestrationError> {
    let path = dir.join(VARIABLES_FILE);
    let content = vars
        .to_tfvars()
        .and_then(|v| serde_json::to_vec_pretty(&v))
        .map_err(|e| {
            OrchestrationError::workspace_io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

    let temp_path = dir.join(format!("{}.tmp", VARIABLES_FILE));
    fs::write(&temp_path, &content)
        .await
        .map_err(|e| OrchestrationError::workspace_io(&temp_path, e))?;
    fs::rename(&temp_path, &path)
        .await
        .map_err(|e| OrchestrationError::workspace_io(&path, e))?;
    Ok(path)
}

/// 工作区与模块 ID 只允许 `[A-Za-z0-9_-]`
fn validate_id(id: &str) -> Result<(), OrchestrationError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(OrchestrationError::InvalidIdentifier(id.to_string()))
    }
}

/// 递归复制目录，返回复制的文件数
async fn copy_dir(source: &Path, dest: &Path) -> Result<usize, OrchestrationError> {
    let mut copied = 0;
    let mut pending = vec![(source.to_path_buf(), dest.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to)
            .await
            .map_err(|e| OrchestrationError::workspace_io(&to, e))?;
        let mut entries = fs::read_dir(&from)
            .await
            .map_err(|e| OrchestrationError::workspace_io(&from, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OrchestrationError::workspace_io(&from, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| OrchestrationError::workspace_io(entry.path(), e))?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target)
                    .await
                    .map_err(|e| OrchestrationError::workspace_io(&target, e))?;
                copied += 1;
            }
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ProviderKind, Resource, TranslationInput};
    use std::time::Duration;

    fn manager(dir: &tempfile::TempDir) -> WorkspaceManager {
        let modules = dir.path().join("modules/hetzner-server/scripts");
        std::fs::create_dir_all(&modules).unwrap();
        std::fs::write(dir.path().join("modules/hetzner-server/main.tf"), "# module").unwrap();
        std::fs::write(modules.join("init.sh"), "#!/bin/sh").unwrap();
        WorkspaceManager::new(dir.path().join("workspaces"), dir.path().join("modules"))
    }

    #[tokio::test]
    async fn test_install_module_copies_tree() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let copied = manager.install_module("ws-1", "hetzner-server").await.unwrap();
        assert_eq!(copied, 2);

        let ws = manager.path("ws-1").unwrap();
        assert!(ws.join("main.tf").exists());
        assert!(ws.join("scripts/init.sh").exists());
    }

    #[tokio::test]
    async fn test_unknown_module() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let result = manager.install_module("ws-1", "vultr-instance").await;
        assert!(matches!(result, Err(OrchestrationError::ModuleNotFound(_))));
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent_and_cleanup_removes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        manager.ensure("ws-1").await.unwrap();
        manager.ensure("ws-1").await.unwrap();
        assert!(manager.exists("ws-1").await);

        manager.cleanup("ws-1").await.unwrap();
        assert!(!manager.exists("ws-1").await);
        // 已删除的工作区再次清理不报错
        manager.cleanup("ws-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_write_variables() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let resource = Resource::new("web-1", ProviderKind::Hetzner, "acct", "fsn1", "cx22", "ubuntu-24.04");
        let vars = ProviderVariables::translate(&TranslationInput {
            resource: &resource,
            firewall: None,
            bootstrap: None,
            callback_url: "",
        })
        .unwrap();

        let path = manager.write_variables("ws-1", &vars).await.unwrap();
        let written: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(written["server_type"], "cx22");
    }

    #[tokio::test]
    async fn test_rejects_traversal_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        assert!(matches!(
            manager.ensure("../outside").await,
            Err(OrchestrationError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(&dir));

        let lease = manager.acquire("ws-1").await.unwrap();
        let contender = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire("ws-1").await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        // 其他工作区不受影响
        manager.acquire("ws-2").await.unwrap();

        drop(lease);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sweep_locks_keeps_held_leases() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let held = manager.acquire("ws-1").await.unwrap();
        drop(manager.acquire("ws-2").await.unwrap());
        drop(manager.acquire("ws-3").await.unwrap());

        assert_eq!(manager.sweep_locks(), 2);
        assert_eq!(manager.sweep_locks(), 0);

        drop(held);
        assert_eq!(manager.sweep_locks(), 1);
        // 清理后仍可重新获取
        manager.acquire("ws-1").await.unwrap();
    }
}
