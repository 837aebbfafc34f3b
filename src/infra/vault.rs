//! 凭据库
//!
//! 云服务商凭据以 age（X25519 + ChaCha20-Poly1305）加密后落盘，
//! 每个账号一个文件：`<dir>/<account_id>.age`。
//! 身份私钥首次启动时生成，权限 0600。

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use age::secrecy::ExposeSecret;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

/// 凭据库错误
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("invalid account id '{0}'")]
    InvalidAccountId(String),
    #[error("identity file {path} has insecure permissions {mode:o}, expected 0600")]
    InsecureIdentity { path: String, mode: u32 },
    #[error("invalid identity file: {0}")]
    InvalidIdentity(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("vault io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 云服务商凭据
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialBundle {
    pub api_token: String,
    /// 其他附加凭据（如 spaces key）
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl CredentialBundle {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
            extra: BTreeMap::new(),
        }
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("api_token", &"[REDACTED]")
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// 凭据库
pub struct CredentialVault {
    identity: age::x25519::Identity,
    recipient: age::x25519::Recipient,
    dir: PathBuf,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("dir", &self.dir)
            .field("recipient", &self.recipient.to_string())
            .finish()
    }
}

impl CredentialVault {
    /// 打开凭据库，身份文件不存在时生成
    pub fn open(identity_path: &Path, dir: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        if !identity_path.exists() {
            create_identity(identity_path)?;
            info!(path = %identity_path.display(), "Generated new vault identity");
        }
        let identity = load_identity(identity_path)?;
        let recipient = identity.to_public();

        Ok(Self {
            identity,
            recipient,
            dir,
        })
    }

    fn blob_path(&self, account_id: &str) -> Result<PathBuf, VaultError> {
        validate_account_id(account_id)?;
        Ok(self.dir.join(format!("{}.age", account_id)))
    }

    /// 加密并保存凭据（覆盖已有）
    pub async fn store(&self, account_id: &str, creds: &CredentialBundle) -> Result<(), VaultError> {
        let path = self.blob_path(account_id)?;
        let plaintext = serde_json::to_vec(creds).map_err(|e| VaultError::Encryption(e.to_string()))?;
        let ciphertext = self.encrypt(&plaintext)?;

        let temp_path = path.with_extension("age.tmp");
        fs::write(&temp_path, &ciphertext).await?;
        fs::rename(&temp_path, &path).await?;

        info!(account_id = %account_id, "Stored credentials");
        Ok(())
    }

    /// 读取并解密凭据
    ///
    /// 不存在或认证失败（篡改、密钥轮换）时返回 None
    pub async fn get(&self, account_id: &str) -> Option<CredentialBundle> {
        let path = match self.blob_path(account_id) {
            Ok(path) => path,
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "Rejected credential lookup");
                return None;
            }
        };

        let ciphertext = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "Failed to read credential blob");
                return None;
            }
        };

        match self.decrypt(&ciphertext) {
            Ok(plaintext) => match serde_json::from_slice(&plaintext) {
                Ok(bundle) => Some(bundle),
                Err(e) => {
                    warn!(account_id = %account_id, error = %e, "Decrypted credentials are malformed");
                    None
                }
            },
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "Failed to decrypt credentials, treating as absent");
                None
            }
        }
    }

    /// 删除凭据，返回是否存在
    pub async fn delete(&self, account_id: &str) -> Result<bool, VaultError> {
        let path = self.blob_path(account_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(account_id = %account_id, "Deleted credentials");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let encryptor = age::Encryptor::with_recipients(vec![Box::new(self.recipient.clone())])
            .ok_or_else(|| VaultError::Encryption("no valid encryption recipients".to_string()))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;
        writer
            .write_all(plaintext)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        Ok(encrypted)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, String> {
        let age::Decryptor::Recipients(decryptor) =
            age::Decryptor::new(ciphertext).map_err(|e| e.to_string())?
        else {
            return Err("unexpected decryptor type".to_string());
        };

        let mut decrypted = vec![];
        let identity: &dyn age::Identity = &self.identity;
        let mut reader = decryptor
            .decrypt(std::iter::once(identity))
            .map_err(|e| e.to_string())?;
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| e.to_string())?;

        Ok(decrypted)
    }
}

/// 账号 ID 只允许 `[A-Za-z0-9_-]`
fn validate_account_id(account_id: &str) -> Result<(), VaultError> {
    let valid = !account_id.is_empty()
        && account_id.len() <= 128
        && account_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(VaultError::InvalidAccountId(account_id.to_string()))
    }
}

fn create_identity(path: &Path) -> Result<(), VaultError> {
    let identity = age::x25519::Identity::generate();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    let mut file = {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?
    };

    #[cfg(not(unix))]
    let mut file = std::fs::File::create(path)?;

    writeln!(file, "# created: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(file, "# public key: {}", identity.to_public())?;
    writeln!(file, "{}", identity.to_string().expose_secret())?;
    Ok(())
}

fn load_identity(path: &Path) -> Result<age::x25519::Identity, VaultError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let mode = std::fs::metadata(path)?.mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(VaultError::InsecureIdentity {
                path: path.display().to_string(),
                mode,
            });
        }
    }

    let contents = std::fs::read_to_string(path)?;
    contents
        .lines()
        .find(|line| !line.starts_with('#') && !line.trim().is_empty())
        .ok_or_else(|| VaultError::InvalidIdentity("identity file is empty".to_string()))?
        .trim()
        .parse::<age::x25519::Identity>()
        .map_err(|e| VaultError::InvalidIdentity(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_vault(dir: &TempDir) -> CredentialVault {
        CredentialVault::open(&dir.path().join("vault.key"), dir.path().join("credentials")).unwrap()
    }

    #[tokio::test]
    async fn test_store_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);

        let mut creds = CredentialBundle::new("dop_v1_secret");
        creds.extra.insert("spaces_key".into(), "abc".into());
        vault.store("acct-1", &creds).await.unwrap();

        assert_eq!(vault.get("acct-1").await, Some(creds));
        assert_eq!(vault.get("acct-2").await, None);

        assert!(vault.delete("acct-1").await.unwrap());
        assert!(!vault.delete("acct-1").await.unwrap());
        assert_eq!(vault.get("acct-1").await, None);
    }

    #[tokio::test]
    async fn test_blob_is_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        vault.store("acct-1", &CredentialBundle::new("very-secret-token")).await.unwrap();

        let blob = std::fs::read(dir.path().join("credentials/acct-1.age")).unwrap();
        let text = String::from_utf8_lossy(&blob);
        assert!(!text.contains("very-secret-token"));
    }

    #[tokio::test]
    async fn test_tampered_blob_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        vault.store("acct-1", &CredentialBundle::new("token")).await.unwrap();

        let path = dir.path().join("credentials/acct-1.age");
        let mut blob = std::fs::read(&path).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        std::fs::write(&path, blob).unwrap();

        assert_eq!(vault.get("acct-1").await, None);
    }

    #[tokio::test]
    async fn test_rotated_identity_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        vault.store("acct-1", &CredentialBundle::new("token")).await.unwrap();

        let rotated = CredentialVault::open(&dir.path().join("other.key"), dir.path().join("credentials")).unwrap();
        assert_eq!(rotated.get("acct-1").await, None);
    }

    #[tokio::test]
    async fn test_identity_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        open_vault(&dir)
            .store("acct-1", &CredentialBundle::new("token"))
            .await
            .unwrap();

        let reopened = open_vault(&dir);
        assert_eq!(reopened.get("acct-1").await.map(|c| c.api_token), Some("token".into()));
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let _vault = open_vault(&dir);
        let mode = std::fs::metadata(dir.path().join("vault.key")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        std::fs::set_permissions(dir.path().join("vault.key"), std::fs::Permissions::from_mode(0o644)).unwrap();
        let result = CredentialVault::open(&dir.path().join("vault.key"), dir.path().join("credentials"));
        assert!(matches!(result, Err(VaultError::InsecureIdentity { .. })));
    }

    #[tokio::test]
    async fn test_rejects_path_like_account_ids() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        let result = vault.store("../escape", &CredentialBundle::new("t")).await;
        assert!(matches!(result, Err(VaultError::InvalidAccountId(_))));
        assert_eq!(vault.get("../escape").await, None);
    }

    #[test]
    fn test_debug_redacts_token() {
        let creds = CredentialBundle::new("super-secret");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }
}
