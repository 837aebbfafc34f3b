//! 资源相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 云服务商
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Digitalocean,
    Hetzner,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Digitalocean => "digitalocean",
            ProviderKind::Hetzner => "hetzner",
        }
    }

    /// 对应的 provisioning 模块名（modules 目录下的子目录）
    pub fn module_name(&self) -> &'static str {
        match self {
            ProviderKind::Digitalocean => "digitalocean-droplet",
            ProviderKind::Hetzner => "hetzner-server",
        }
    }

    /// 传给 provisioning 工具的凭据环境变量
    ///
    /// token 只通过子进程环境传递，不写入变量文件
    pub fn token_env_vars(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::Digitalocean => &["DIGITALOCEAN_TOKEN", "TF_VAR_do_token"],
            ProviderKind::Hetzner => &["HCLOUD_TOKEN", "TF_VAR_hcloud_token"],
        }
    }
}

/// 资源状态（期望状态与实际状态共用）
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Pending,
    Provisioning,
    Running,
    Rebooting,
    Refreshing,
    Destroying,
    Destroyed,
    Error,
    /// 部署被取消，实际状态无法确认
    Unknown,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Provisioning => "provisioning",
            ResourceStatus::Running => "running",
            ResourceStatus::Rebooting => "rebooting",
            ResourceStatus::Refreshing => "refreshing",
            ResourceStatus::Destroying => "destroying",
            ResourceStatus::Destroyed => "destroyed",
            ResourceStatus::Error => "error",
            ResourceStatus::Unknown => "unknown",
        }
    }
}

/// 网络地址
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkAddresses {
    pub public_ipv4: Option<String>,
    pub private_ipv4: Option<String>,
    pub public_ipv6: Option<String>,
}

/// 受管理的计算资源
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    /// 凭据所属的云账号 ID
    pub account_id: String,
    pub region: String,
    pub size: String,
    pub image: String,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    pub desired_status: ResourceStatus,
    pub actual_status: ResourceStatus,
    /// 云服务商侧的资源 ID（apply 成功后同步）
    pub provider_resource_id: Option<String>,
    #[serde(default)]
    pub addresses: NetworkAddresses,
    pub workspace_id: String,
    pub firewall_profile_id: Option<String>,
    pub bootstrap_profile_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// 创建新资源，工作区 ID 由资源 ID 派生，整个生命周期内不变
    pub fn new(
        name: impl Into<String>,
        provider: ProviderKind,
        account_id: impl Into<String>,
        region: impl Into<String>,
        size: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        Self {
            workspace_id: format!("ws-{}", id),
            id,
            name: name.into(),
            provider,
            account_id: account_id.into(),
            region: region.into(),
            size: size.into(),
            image: image.into(),
            ssh_keys: Vec::new(),
            desired_status: ResourceStatus::Running,
            actual_status: ResourceStatus::Pending,
            provider_resource_id: None,
            addresses: NetworkAddresses::default(),
            firewall_profile_id: None,
            bootstrap_profile_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 防火墙规则方向
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    Inbound,
    Outbound,
}

/// 防火墙协议
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl RuleProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleProtocol::Tcp => "tcp",
            RuleProtocol::Udp => "udp",
            RuleProtocol::Icmp => "icmp",
        }
    }
}

/// 防火墙规则（与云服务商无关的领域表示）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FirewallRule {
    pub direction: RuleDirection,
    pub protocol: RuleProtocol,
    /// 端口或端口范围，如 "22" / "8000-8100"；为空表示全部端口
    pub ports: Option<String>,
    /// CIDR 列表，为空表示任意地址
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// 防火墙配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirewallProfile {
    pub id: String,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
}

/// 启动引导配置（cloud-init / user-data 模板）
///
/// 模板中的 `{{resource_id}}` 与 `{{callback_url}}` 在翻译变量时替换
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapProfile {
    pub id: String,
    pub template: String,
}
