//! 环境变量配置加载

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API 密钥
    pub api_key: String,
    /// 服务监听端口
    pub port: u16,
    /// 数据目录（部署记录、凭据、工作区）
    pub data_dir: PathBuf,
    /// provisioning 工具配置
    pub tool: ToolConfig,
    /// 凭据库身份文件（未配置时使用 data_dir/vault.key）
    pub vault_identity: Option<PathBuf>,
    /// 启动引导模板中的回调地址
    pub callback_url: String,
    /// 云服务商控制 API
    pub provider_api: ProviderApiConfig,
    /// 重启轮询策略
    pub reboot: RebootPolicy,
    /// 人工审批等待上限
    pub approval_timeout: Duration,
}

/// provisioning 工具配置
#[derive(Clone, Debug)]
pub struct ToolConfig {
    /// 工具二进制（名称或路径）
    pub binary: String,
    /// 模块模板目录，未设置时为 data_dir/modules
    pub modules_dir: Option<PathBuf>,
    /// 工作区根目录，未设置时为 data_dir/workspaces
    pub workspaces_dir: Option<PathBuf>,
    /// 单个子命令超时
    pub command_timeout: Duration,
}

/// 云服务商控制 API 地址
#[derive(Clone, Debug)]
pub struct ProviderApiConfig {
    pub digitalocean_url: String,
    pub hetzner_url: String,
}

/// 重启状态轮询策略
#[derive(Clone, Copy, Debug)]
pub struct RebootPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        // API Key - 支持旧名称兼容
        let api_key = load_with_fallback("PROVISION_AGENT_API_KEY", "API_KEY")
            .unwrap_or_else(|| "change-me-in-production".to_string());
        if env::var("API_KEY").is_ok() {
            warn!("Deprecated environment variable API_KEY detected. Please use PROVISION_AGENT_API_KEY");
        }

        let data_dir = env::var("XJP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let mut config = Self::with_data_dir(data_dir);
        config.api_key = api_key;

        if let Some(port) = parse_env("PORT") {
            config.port = port;
        }

        config.tool = ToolConfig::from_env();
        config.vault_identity = env::var("PROVISION_VAULT_IDENTITY")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        if let Ok(url) = env::var("BOOTSTRAP_CALLBACK_URL") {
            config.callback_url = url;
        }
        config.provider_api = ProviderApiConfig::from_env();
        config.reboot = RebootPolicy::from_env();
        if let Some(secs) = parse_env("APPROVAL_TIMEOUT_SECS") {
            config.approval_timeout = Duration::from_secs(secs);
        }

        config
    }

    /// 以默认值构建配置，不读取环境变量
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_key: "change-me-in-production".to_string(),
            port: 9877,
            data_dir: data_dir.into(),
            tool: ToolConfig::default(),
            vault_identity: None,
            callback_url: String::new(),
            provider_api: ProviderApiConfig::default(),
            reboot: RebootPolicy::default(),
            approval_timeout: Duration::from_secs(constants::APPROVAL_TIMEOUT_SECS),
        }
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.tool
            .modules_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("modules"))
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.tool
            .workspaces_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("workspaces"))
    }

    pub fn vault_identity_path(&self) -> PathBuf {
        self.vault_identity
            .clone()
            .unwrap_or_else(|| self.data_dir.join("vault.key"))
    }

    pub fn vault_dir(&self) -> PathBuf {
        self.data_dir.join("credentials")
    }

    pub fn store_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            modules_dir: None,
            workspaces_dir: None,
            command_timeout: Duration::from_secs(constants::COMMAND_TIMEOUT_SECS),
        }
    }
}

impl ToolConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            binary: env::var("PROVISION_TOOL_BINARY")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.binary),
            modules_dir: env::var("PROVISION_MODULES_DIR").ok().map(PathBuf::from),
            workspaces_dir: env::var("PROVISION_WORKSPACES_DIR").ok().map(PathBuf::from),
            command_timeout: parse_env("COMMAND_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.command_timeout),
        }
    }
}

impl Default for ProviderApiConfig {
    fn default() -> Self {
        Self {
            digitalocean_url: "https://api.digitalocean.com".to_string(),
            hetzner_url: "https://api.hetzner.cloud".to_string(),
        }
    }
}

impl ProviderApiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            digitalocean_url: env::var("DIGITALOCEAN_API_URL").unwrap_or(defaults.digitalocean_url),
            hetzner_url: env::var("HETZNER_API_URL").unwrap_or(defaults.hetzner_url),
        }
    }
}

impl Default for RebootPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(constants::REBOOT_POLL_INTERVAL_SECS),
            max_attempts: constants::REBOOT_MAX_ATTEMPTS,
        }
    }
}

impl RebootPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: parse_env("REBOOT_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            max_attempts: parse_env("REBOOT_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

/// 常量
pub mod constants {
    /// 单个 provisioning 子命令超时（秒）
    pub const COMMAND_TIMEOUT_SECS: u64 = 1800; // 30 分钟

    /// 重启状态轮询间隔（秒）
    pub const REBOOT_POLL_INTERVAL_SECS: u64 = 5;

    /// 重启状态最大轮询次数
    pub const REBOOT_MAX_ATTEMPTS: u32 = 60;

    /// 人工审批等待上限（秒）
    pub const APPROVAL_TIMEOUT_SECS: u64 = 3600;

    /// 错误信息最大字符数
    pub const MAX_ERROR_MESSAGE_CHARS: usize = 4096;

    /// 每个部署在内存中缓冲的日志条数
    pub const LOG_HISTORY_CAPACITY: usize = 5000;

    /// 失败信息保留的错误行数
    pub const ERROR_TAIL_LINES: usize = 20;

    /// SSE 消费者轮询部署状态的间隔（毫秒）
    pub const STREAM_POLL_INTERVAL_MS: u64 = 1000;

    /// 运行中部署的日志持久化间隔（毫秒）
    pub const LOG_FLUSH_INTERVAL_MS: u64 = 500;

    /// 日志通道清理间隔（秒）
    pub const LOG_CLEANUP_INTERVAL_SECS: u64 = 300;

    /// 日志通道最大保留时间（小时）
    pub const LOG_CHANNEL_MAX_AGE_HOURS: i64 = 24;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
