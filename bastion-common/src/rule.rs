//! Firewall rules, their owning configuration and application

use serde::{Deserialize, Serialize};

/// How a rule is enforced by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionMode {
    /// Direct ban decision, no scenario
    IpBan,
    /// Payload inspection in the request path
    Inband,
    /// Log-based detection after the fact
    Outofband,
    /// Log-based detection plus payload inspection
    Hybrid,
    /// Payload inspection restricted to matching paths
    PathOnly,
}

impl ProtectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionMode::IpBan => "ip_ban",
            ProtectionMode::Inband => "inband",
            ProtectionMode::Outofband => "outofband",
            ProtectionMode::Hybrid => "hybrid",
            ProtectionMode::PathOnly => "path_only",
        }
    }
}

/// Remediation applied when a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Ban,
    Captcha,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Ban => "ban",
            RuleAction::Captcha => "captcha",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

impl LogicalOperator {
    /// Boolean joiner in the engine filter grammar
    pub fn joiner(&self) -> &'static str {
        match self {
            LogicalOperator::And => " && ",
            LogicalOperator::Or => " || ",
        }
    }
}

/// One user-authored condition.
///
/// `field` and `operator` are kept as the raw strings the user picked so
/// that an unknown value surfaces as a compilation error with the
/// offending text instead of a deserialization failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: String,
    pub value: String,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value: value.into(),
        }
    }
}

/// Firewall rule owned by a [`FirewallConfig`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Repository identifier, unique across all configs; 0 until saved
    #[serde(default)]
    pub id: u64,
    /// Owning config, assigned on save
    #[serde(default)]
    pub config_id: u64,
    /// Human name, not unique
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub protection_mode: ProtectionMode,
    pub action: RuleAction,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    /// Ordered conditions
    pub conditions: Vec<Condition>,
    /// Lower runs first in compiled output
    #[serde(default)]
    pub priority: i32,
    /// Per-rule remediation override in seconds
    #[serde(default)]
    pub remediation_duration: Option<u64>,
}

impl FirewallRule {
    /// Effective remediation duration, falling back to the config's ban duration
    pub fn duration_seconds(&self, config: &FirewallConfig) -> u64 {
        self.remediation_duration.unwrap_or(config.ban_duration)
    }

    pub fn is_ip_ban(&self) -> bool {
        self.protection_mode == ProtectionMode::IpBan
    }
}

/// Per-application firewall settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallConfig {
    pub id: u64,
    /// Filled in from the owning application on registration
    #[serde(default)]
    pub application_id: u64,
    pub enabled: bool,
    /// Opaque engine credential used by the bouncer
    #[serde(default)]
    pub api_key: String,
    /// Seconds
    #[serde(default = "default_ban_duration")]
    pub ban_duration: u64,
    #[serde(default)]
    pub appsec_enabled: bool,
    #[serde(default)]
    pub inband_enabled: bool,
    /// Engine bouncer registered with `api_key`; cleared when the key changes
    #[serde(default)]
    pub bouncer_name: Option<String>,
}

impl FirewallConfig {
    /// True when the feature is switched on and has a credential to use
    pub fn is_active(&self) -> bool {
        self.enabled && !self.api_key.trim().is_empty()
    }

    /// Enabled, but the engine does not know this application's bouncer yet
    pub fn needs_bouncer(&self) -> bool {
        self.enabled && self.bouncer_name.is_none()
    }
}

/// Application that owns one firewall config, deployed on one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: u64,
    pub uuid: String,
    pub name: String,
    pub server_id: u64,
}

fn default_true() -> bool {
    true
}

fn default_ban_duration() -> u64 {
    crate::DEFAULT_BAN_DURATION_SECONDS
}
