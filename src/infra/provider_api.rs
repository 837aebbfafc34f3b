//! 云服务商控制 API Client
//!
//! 重启不经过 provisioning 工具，直接调用服务商 API：发起 action 后轮询状态。
//! DigitalOcean 与 Hetzner Cloud 的 action 响应都是 `{"action": {"id", "status", ...}}`。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ProviderApiConfig;
use crate::domain::ProviderKind;
use crate::error::OrchestrationError;
use crate::infra::vault::CredentialBundle;

/// 服务商 action 状态
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionStatus {
    InProgress,
    Completed,
    Errored(String),
}

/// 服务商控制接口
#[async_trait]
pub trait ProviderControl: Send + Sync {
    /// 发起重启，返回 action ID
    async fn reboot(
        &self,
        provider: ProviderKind,
        creds: &CredentialBundle,
        provider_resource_id: &str,
    ) -> Result<String, OrchestrationError>;

    /// 查询 action 状态
    async fn action_status(
        &self,
        provider: ProviderKind,
        creds: &CredentialBundle,
        action_id: &str,
    ) -> Result<ActionStatus, OrchestrationError>;
}

#[derive(Deserialize)]
struct ActionEnvelope {
    action: ActionBody,
}

#[derive(Deserialize)]
struct ActionBody {
    id: serde_json::Value,
    status: String,
    #[serde(default)]
    error: Option<ActionError>,
}

#[derive(Deserialize)]
struct ActionError {
    #[serde(default)]
    message: String,
}

impl ActionBody {
    fn id_string(&self) -> String {
        match &self.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn status(&self) -> ActionStatus {
        match self.status.as_str() {
            // DigitalOcean: in-progress / completed / errored
            // Hetzner: running / success / error
            "completed" | "success" => ActionStatus::Completed,
            "errored" | "error" => ActionStatus::Errored(
                self.error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("action {} errored", self.id_string())),
            ),
            _ => ActionStatus::InProgress,
        }
    }
}

/// HTTP 实现
#[derive(Clone)]
pub struct HttpProviderClient {
    client: Client,
    config: ProviderApiConfig,
}

impl HttpProviderClient {
    pub fn new(config: ProviderApiConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, config }
    }

    fn reboot_url(&self, provider: ProviderKind, provider_resource_id: &str) -> String {
        match provider {
            ProviderKind::Digitalocean => format!(
                "{}/v2/droplets/{}/actions",
                self.config.digitalocean_url.trim_end_matches('/'),
                provider_resource_id
            ),
            ProviderKind::Hetzner => format!(
                "{}/v1/servers/{}/actions/reboot",
                self.config.hetzner_url.trim_end_matches('/'),
                provider_resource_id
            ),
        }
    }

    fn action_url(&self, provider: ProviderKind, action_id: &str) -> String {
        match provider {
            ProviderKind::Digitalocean => format!(
                "{}/v2/actions/{}",
                self.config.digitalocean_url.trim_end_matches('/'),
                action_id
            ),
            ProviderKind::Hetzner => format!(
                "{}/v1/actions/{}",
                self.config.hetzner_url.trim_end_matches('/'),
                action_id
            ),
        }
    }

    async fn read_action(response: reqwest::Response) -> Result<ActionBody, OrchestrationError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(OrchestrationError::CredentialsInvalid(format!(
                "provider returned {}",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestrationError::Provider(format!("{}: {}", status, body)));
        }
        response
            .json::<ActionEnvelope>()
            .await
            .map(|envelope| envelope.action)
            .map_err(|e| OrchestrationError::Provider(format!("invalid action response: {}", e)))
    }
}

#[async_trait]
impl ProviderControl for HttpProviderClient {
    async fn reboot(
        &self,
        provider: ProviderKind,
        creds: &CredentialBundle,
        provider_resource_id: &str,
    ) -> Result<String, OrchestrationError> {
        let url = self.reboot_url(provider, provider_resource_id);
        let request = self.client.post(&url).bearer_auth(&creds.api_token);
        let request = match provider {
            ProviderKind::Digitalocean => request.json(&serde_json::json!({ "type": "reboot" })),
            ProviderKind::Hetzner => request,
        };

        let response = request.send().await.map_err(|e| {
            warn!(provider = %provider.as_str(), error = %e, "Reboot request failed");
            OrchestrationError::Provider(e.to_string())
        })?;
        let action = Self::read_action(response).await?;

        info!(
            provider = %provider.as_str(),
            provider_resource_id = %provider_resource_id,
            action_id = %action.id_string(),
            "Reboot action submitted"
        );
        Ok(action.id_string())
    }

    async fn action_status(
        &self,
        provider: ProviderKind,
        creds: &CredentialBundle,
        action_id: &str,
    ) -> Result<ActionStatus, OrchestrationError> {
        let url = self.action_url(provider, action_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&creds.api_token)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| OrchestrationError::Provider(e.to_string()))?;
        Ok(Self::read_action(response).await?.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpProviderClient {
        HttpProviderClient::new(ProviderApiConfig {
            digitalocean_url: "https://do.example/".to_string(),
            hetzner_url: "https://hz.example".to_string(),
        })
    }

    #[test]
    fn test_urls() {
        let client = client();
        assert_eq!(
            client.reboot_url(ProviderKind::Digitalocean, "42"),
            "https://do.example/v2/droplets/42/actions"
        );
        assert_eq!(
            client.reboot_url(ProviderKind::Hetzner, "7"),
            "https://hz.example/v1/servers/7/actions/reboot"
        );
        assert_eq!(client.action_url(ProviderKind::Digitalocean, "9"), "https://do.example/v2/actions/9");
        assert_eq!(client.action_url(ProviderKind::Hetzner, "9"), "https://hz.example/v1/actions/9");
    }

    #[test]
    fn test_action_status_mapping() {
        let parse = |raw: &str| serde_json::from_str::<ActionEnvelope>(raw).unwrap().action;

        let action = parse(r#"{"action": {"id": 36804636, "status": "in-progress", "type": "reboot"}}"#);
        assert_eq!(action.id_string(), "36804636");
        assert_eq!(action.status(), ActionStatus::InProgress);

        assert_eq!(parse(r#"{"action": {"id": 1, "status": "completed"}}"#).status(), ActionStatus::Completed);
        assert_eq!(parse(r#"{"action": {"id": 1, "status": "success"}}"#).status(), ActionStatus::Completed);
        assert_eq!(parse(r#"{"action": {"id": 1, "status": "running"}}"#).status(), ActionStatus::InProgress);

        let errored = parse(r#"{"action": {"id": 13, "status": "error", "error": {"code": "action_failed", "message": "Action failed"}}}"#);
        assert_eq!(errored.status(), ActionStatus::Errored("Action failed".to_string()));

        let errored = parse(r#"{"action": {"id": 13, "status": "errored"}}"#);
        assert_eq!(errored.status(), ActionStatus::Errored("action 13 errored".to_string()));
    }
}
