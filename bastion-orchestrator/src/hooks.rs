//! Outbound webhooks: application redeploys and permanent install failures

use async_trait::async_trait;
use bastion_common::{Component, Server, ServerId};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, SecurityError};

// ============================================================================
// Application redeploy trigger
// ============================================================================

/// Queues an application redeploy on the PaaS. Idempotent.
#[async_trait]
pub trait DeploymentTrigger: Send + Sync + 'static {
    async fn enqueue_deployment(
        &self,
        application_id: u64,
        correlation_id: Uuid,
        force_rebuild: bool,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeployWebhookPayload {
    pub application_id: u64,
    pub correlation_id: Uuid,
    pub force_rebuild: bool,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

pub struct WebhookDeploymentTrigger {
    http_client: Client,
    url: String,
}

impl WebhookDeploymentTrigger {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl DeploymentTrigger for WebhookDeploymentTrigger {
    #[instrument(skip(self))]
    async fn enqueue_deployment(
        &self,
        application_id: u64,
        correlation_id: Uuid,
        force_rebuild: bool,
    ) -> Result<()> {
        let payload = RedeployWebhookPayload {
            application_id,
            correlation_id,
            force_rebuild,
            reason: "FIREWALL_RULES_CHANGED".to_string(),
            timestamp: Utc::now(),
        };

        let response = self.http_client.post(&self.url).json(&payload).send().await?;

        if response.status().is_success() {
            info!(status = %response.status(), "Redeploy webhook called successfully");
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "unknown".to_string());
            Err(SecurityError::Transport(format!(
                "redeploy webhook returned {}: {}",
                status, body
            )))
        }
    }
}

/// Used when no redeploy endpoint is configured
pub struct LogOnlyDeploymentTrigger;

#[async_trait]
impl DeploymentTrigger for LogOnlyDeploymentTrigger {
    async fn enqueue_deployment(
        &self,
        application_id: u64,
        correlation_id: Uuid,
        force_rebuild: bool,
    ) -> Result<()> {
        warn!(
            application_id,
            correlation_id = %correlation_id,
            force_rebuild,
            "No redeploy webhook configured, proxy labels apply on next deploy"
        );
        Ok(())
    }
}

// ============================================================================
// Permanent failure hook
// ============================================================================

#[async_trait]
pub trait FailureHook: Send + Sync + 'static {
    async fn on_permanent_failure(&self, server: &Server, component: Component, error: &SecurityError);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureWebhookPayload {
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub server_id: ServerId,
    pub server_name: String,
    pub component: Component,
    pub error: String,
}

pub struct WebhookFailureHook {
    http_client: Client,
    url: String,
}

impl WebhookFailureHook {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl FailureHook for WebhookFailureHook {
    async fn on_permanent_failure(&self, server: &Server, component: Component, err: &SecurityError) {
        let payload = FailureWebhookPayload {
            reason: "SECURITY_COMPONENT_INSTALL_FAILED".to_string(),
            timestamp: Utc::now(),
            server_id: server.id,
            server_name: server.name.clone(),
            component,
            error: err.to_string(),
        };

        error!(
            server_id = server.id,
            component = %component,
            webhook_url = %self.url,
            "Security component permanently failed, notifying"
        );

        match self.http_client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!(status = %response.status(), "Failure webhook called successfully");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_else(|_| "unknown".to_string());
                error!(status = %status, body = %body, "Failure webhook returned error");
            }
            Err(e) => error!(error = %e, "Failed to send failure webhook"),
        }
    }
}

pub struct LogOnlyFailureHook;

#[async_trait]
impl FailureHook for LogOnlyFailureHook {
    async fn on_permanent_failure(&self, server: &Server, component: Component, err: &SecurityError) {
        error!(
            server_id = server.id,
            server = %server.name,
            component = %component,
            error = %err,
            "Security component permanently failed"
        );
    }
}
