//! provisioning 工具变量
//!
//! 资源、防火墙配置、引导配置翻译为按服务商区分的变量集。
//! 每个变体有各自的校验规则，序列化结果即 `terraform.tfvars.json` 的内容。

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use super::resource::{
    BootstrapProfile, FirewallProfile, FirewallRule, ProviderKind, Resource, RuleDirection,
    RuleProtocol,
};

/// tcp/udp 规则未限制端口时使用的端口范围
const ALL_PORTS: &str = "1-65535";

/// 变量翻译与校验错误
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum VariablesError {
    #[error("invalid resource name '{0}': must be a lowercase DNS label")]
    InvalidName(String),
    #[error("missing required variable '{0}'")]
    Missing(&'static str),
    #[error("invalid port range '{0}'")]
    InvalidPorts(String),
    #[error("icmp rules cannot restrict ports")]
    IcmpWithPorts,
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),
}

/// 翻译输入
pub struct TranslationInput<'a> {
    pub resource: &'a Resource,
    pub firewall: Option<&'a FirewallProfile>,
    pub bootstrap: Option<&'a BootstrapProfile>,
    /// 替换进引导模板的回调地址
    pub callback_url: &'a str,
}

/// 服务商变量集，按 provider 字段区分
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderVariables {
    Digitalocean(DigitalOceanVariables),
    Hetzner(HetznerVariables),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DigitalOceanVariables {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: String,
    pub ssh_keys: Vec<String>,
    pub user_data: String,
    pub tags: Vec<String>,
    pub inbound_rules: Vec<DigitalOceanRule>,
    pub outbound_rules: Vec<DigitalOceanRule>,
}

/// DigitalOcean 防火墙规则
///
/// 模块中入站规则的 `addresses` 对应 source_addresses，出站对应 destination_addresses
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DigitalOceanRule {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<String>,
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HetznerVariables {
    pub name: String,
    pub location: String,
    pub server_type: String,
    pub image: String,
    pub ssh_keys: Vec<String>,
    pub user_data: String,
    pub labels: BTreeMap<String, String>,
    pub firewall_rules: Vec<HetznerRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HetznerRule {
    /// "in" 或 "out"
    pub direction: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destination_ips: Vec<String>,
}

impl ProviderVariables {
    /// 把领域对象翻译为服务商变量并校验
    pub fn translate(input: &TranslationInput<'_>) -> Result<Self, VariablesError> {
        let resource = input.resource;
        let user_data = input
            .bootstrap
            .map(|b| render_bootstrap(&b.template, &resource.id, input.callback_url))
            .unwrap_or_default();
        let rules: &[FirewallRule] = input.firewall.map_or(&[], |f| f.rules.as_slice());

        let vars = match resource.provider {
            ProviderKind::Digitalocean => {
                let mut inbound_rules = Vec::new();
                let mut outbound_rules = Vec::new();
                for rule in rules {
                    let flattened = DigitalOceanRule {
                        protocol: rule.protocol.as_str().to_string(),
                        port_range: rule_ports(rule)?,
                        addresses: rule_addresses(rule)?,
                    };
                    match rule.direction {
                        RuleDirection::Inbound => inbound_rules.push(flattened),
                        RuleDirection::Outbound => outbound_rules.push(flattened),
                    }
                }
                ProviderVariables::Digitalocean(DigitalOceanVariables {
                    name: resource.name.clone(),
                    region: resource.region.clone(),
                    size: resource.size.clone(),
                    image: resource.image.clone(),
                    ssh_keys: resource.ssh_keys.clone(),
                    user_data,
                    tags: vec![
                        "xjp-managed".to_string(),
                        format!("resource-{}", resource.id),
                    ],
                    inbound_rules,
                    outbound_rules,
                })
            }
            ProviderKind::Hetzner => {
                let mut firewall_rules = Vec::new();
                for rule in rules {
                    let addresses = rule_addresses(rule)?;
                    let (direction, source_ips, destination_ips) = match rule.direction {
                        RuleDirection::Inbound => ("in", addresses, Vec::new()),
                        RuleDirection::Outbound => ("out", Vec::new(), addresses),
                    };
                    firewall_rules.push(HetznerRule {
                        direction: direction.to_string(),
                        protocol: rule.protocol.as_str().to_string(),
                        port: rule_ports(rule)?,
                        source_ips,
                        destination_ips,
                    });
                }
                let mut labels = BTreeMap::new();
                labels.insert("managed-by".to_string(), "xjp".to_string());
                labels.insert("resource-id".to_string(), resource.id.clone());
                ProviderVariables::Hetzner(HetznerVariables {
                    name: resource.name.clone(),
                    location: resource.region.clone(),
                    server_type: resource.size.clone(),
                    image: resource.image.clone(),
                    ssh_keys: resource.ssh_keys.clone(),
                    user_data,
                    labels,
                    firewall_rules,
                })
            }
        };

        vars.validate()?;
        Ok(vars)
    }

    pub fn provider(&self) -> ProviderKind {
        match self {
            ProviderVariables::Digitalocean(_) => ProviderKind::Digitalocean,
            ProviderVariables::Hetzner(_) => ProviderKind::Hetzner,
        }
    }

    /// 校验变体字段
    pub fn validate(&self) -> Result<(), VariablesError> {
        match self {
            ProviderVariables::Digitalocean(v) => {
                validate_name(&v.name)?;
                require("region", &v.region)?;
                require("size", &v.size)?;
                require("image", &v.image)?;
                for rule in v.inbound_rules.iter().chain(v.outbound_rules.iter()) {
                    validate_rule(&rule.protocol, rule.port_range.as_deref(), &rule.addresses)?;
                }
            }
            ProviderVariables::Hetzner(v) => {
                validate_name(&v.name)?;
                require("location", &v.location)?;
                require("server_type", &v.server_type)?;
                require("image", &v.image)?;
                for rule in &v.firewall_rules {
                    let addresses = if rule.direction == "in" {
                        &rule.source_ips
                    } else {
                        &rule.destination_ips
                    };
                    validate_rule(&rule.protocol, rule.port.as_deref(), addresses)?;
                }
            }
        }
        Ok(())
    }

    /// 变量文件内容（不含 provider 标签）
    pub fn to_tfvars(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            ProviderVariables::Digitalocean(v) => serde_json::to_value(v),
            ProviderVariables::Hetzner(v) => serde_json::to_value(v),
        }
    }
}

fn bootstrap_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*(resource_id|callback_url)\s*\}\}").expect("valid bootstrap token regex")
    })
}

fn dns_label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("valid label regex"))
}

/// 替换已知占位符，其余内容原样保留
pub fn render_bootstrap(template: &str, resource_id: &str, callback_url: &str) -> String {
    bootstrap_token_regex()
        .replace_all(template, |caps: &Captures<'_>| match &caps[1] {
            "resource_id" => resource_id.to_string(),
            _ => callback_url.to_string(),
        })
        .into_owned()
}

fn rule_ports(rule: &FirewallRule) -> Result<Option<String>, VariablesError> {
    match (rule.protocol, rule.ports.as_deref()) {
        (RuleProtocol::Icmp, None) => Ok(None),
        (RuleProtocol::Icmp, Some(_)) => Err(VariablesError::IcmpWithPorts),
        (_, None) => Ok(Some(ALL_PORTS.to_string())),
        (_, Some(ports)) => {
            let ports = ports.trim();
            parse_port_range(ports)?;
            Ok(Some(ports.to_string()))
        }
    }
}

fn rule_addresses(rule: &FirewallRule) -> Result<Vec<String>, VariablesError> {
    if rule.addresses.is_empty() {
        return Ok(vec!["0.0.0.0/0".to_string(), "::/0".to_string()]);
    }
    for cidr in &rule.addresses {
        validate_cidr(cidr)?;
    }
    Ok(rule.addresses.clone())
}

fn validate_name(name: &str) -> Result<(), VariablesError> {
    if dns_label_regex().is_match(name) {
        Ok(())
    } else {
        Err(VariablesError::InvalidName(name.to_string()))
    }
}

fn require(field: &'static str, value: &str) -> Result<(), VariablesError> {
    if value.trim().is_empty() {
        Err(VariablesError::Missing(field))
    } else {
        Ok(())
    }
}

fn validate_rule(protocol: &str, ports: Option<&str>, addresses: &[String]) -> Result<(), VariablesError> {
    match (protocol, ports) {
        ("icmp", Some(_)) => return Err(VariablesError::IcmpWithPorts),
        ("icmp", None) => {}
        (_, Some(p)) => {
            parse_port_range(p)?;
        }
        (_, None) => return Err(VariablesError::InvalidPorts(String::new())),
    }
    for cidr in addresses {
        validate_cidr(cidr)?;
    }
    Ok(())
}

fn parse_port_range(ports: &str) -> Result<(u16, u16), VariablesError> {
    let invalid = || VariablesError::InvalidPorts(ports.to_string());
    let (lo, hi) = match ports.split_once('-') {
        Some((lo, hi)) => (lo.trim(), hi.trim()),
        None => (ports.trim(), ports.trim()),
    };
    let lo: u16 = lo.parse().map_err(|_| invalid())?;
    let hi: u16 = hi.parse().map_err(|_| invalid())?;
    if lo == 0 || lo > hi {
        return Err(invalid());
    }
    Ok((lo, hi))
}

fn validate_cidr(cidr: &str) -> Result<(), VariablesError> {
    let invalid = || VariablesError::InvalidCidr(cidr.to_string());
    let (ip, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let ip: IpAddr = ip.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if ip.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok(())
}
