//! Server security status and the components provisioned onto it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type ServerId = u64;

/// Security component installed by the bootstrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Intrusion detection engine plus its local API
    #[serde(rename = "crowdsec")]
    CrowdSec,
    /// Proxy access log
    RequestLogging,
    /// Extra request headers in the access log
    HeaderLogging,
    /// Engine acquisition of the proxy access log
    LogShipping,
    /// Traffic metrics sidecar
    TrafficLogger,
    /// Post-install validation pass
    Validator,
}

impl Component {
    /// Components that own install flags, in install order
    pub const INSTALLABLE: [Component; 5] = [
        Component::CrowdSec,
        Component::RequestLogging,
        Component::HeaderLogging,
        Component::LogShipping,
        Component::TrafficLogger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::CrowdSec => "crowdsec",
            Component::RequestLogging => "request_logging",
            Component::HeaderLogging => "header_logging",
            Component::LogShipping => "log_shipping",
            Component::TrafficLogger => "traffic_logger",
            Component::Validator => "validator",
        }
    }

    /// Whether the component's own flags report it installed
    pub fn is_installed(&self, status: &SecurityStatus) -> bool {
        match self {
            Component::CrowdSec => status.crowdsec_installed,
            Component::RequestLogging => status.traefik_logging_enabled,
            Component::HeaderLogging => status.header_logging_enabled,
            Component::LogShipping => status.log_shipping_configured,
            Component::TrafficLogger => status.traffic_logger_installed,
            Component::Validator => status.installation_validated,
        }
    }

    /// Write this component's flags and nothing else
    pub fn apply_flags(&self, status: &mut SecurityStatus, installed: bool) {
        match self {
            Component::CrowdSec => {
                status.crowdsec_installed = installed;
                status.crowdsec_available = installed;
                if !installed {
                    status.appsec_available = false;
                }
            }
            Component::RequestLogging => status.traefik_logging_enabled = installed,
            Component::HeaderLogging => status.header_logging_enabled = installed,
            Component::LogShipping => status.log_shipping_configured = installed,
            Component::TrafficLogger => status.traffic_logger_installed = installed,
            Component::Validator => status.installation_validated = installed,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable security flags of a server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityStatus {
    pub crowdsec_installed: bool,
    pub crowdsec_available: bool,
    /// Payload inspection component reachable on the engine
    pub appsec_available: bool,
    pub traefik_logging_enabled: bool,
    pub header_logging_enabled: bool,
    pub log_shipping_configured: bool,
    pub traffic_logger_installed: bool,
    pub installation_validated: bool,
    pub last_validation_at: Option<DateTime<Utc>>,
    /// Last validation result keyed by component name
    #[serde(default)]
    pub validation_details: BTreeMap<String, ComponentHealth>,
}

impl SecurityStatus {
    /// Installable components whose flags are still false
    pub fn missing_components(&self) -> Vec<Component> {
        Component::INSTALLABLE
            .into_iter()
            .filter(|c| !c.is_installed(self))
            .collect()
    }
}

/// Result of a single component health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub message: String,
}

impl ComponentHealth {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

/// Informational provisioning progress. The flags in [`SecurityStatus`]
/// remain the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "component", rename_all = "snake_case")]
pub enum ProvisioningState {
    #[default]
    Requested,
    Installing(Component),
    Validating,
    Validated,
    Failed(Component),
}

/// A managed server. Connection details are only what the transports need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    /// Hostname or IP reachable over SSH
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub status: SecurityStatus,
    #[serde(default)]
    pub state: ProvisioningState,
}

impl Server {
    pub fn new(id: ServerId, name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            host: host.into(),
            user: default_ssh_user(),
            port: default_ssh_port(),
            status: SecurityStatus::default(),
            state: ProvisioningState::default(),
        }
    }
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}
