//! Deployment context: everything one rule operation needs, fetched once

use bastion_common::{Application, FirewallConfig, FirewallRule, ProtectionMode, Server};
use serde::Serialize;

/// Snapshot of an application's firewall state and the server it runs on.
///
/// Compilation and label generation are pure functions of this value.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentContext {
    pub application: Application,
    pub config: FirewallConfig,
    /// Sorted by priority, then id
    pub rules: Vec<FirewallRule>,
    pub server: Server,
}

impl DeploymentContext {
    pub fn new(
        application: Application,
        config: FirewallConfig,
        mut rules: Vec<FirewallRule>,
        server: Server,
    ) -> Self {
        rules.sort_by_key(|rule| (rule.priority, rule.id));
        Self {
            application,
            config,
            rules,
            server,
        }
    }

    pub fn app_uuid(&self) -> &str {
        &self.application.uuid
    }

    /// Enabled rules that compile to scenarios
    pub fn scenario_rules(&self) -> impl Iterator<Item = &FirewallRule> {
        self.rules
            .iter()
            .filter(|rule| rule.enabled && !rule.is_ip_ban())
    }

    pub fn rule(&self, rule_id: u64) -> Option<&FirewallRule> {
        self.rules.iter().find(|rule| rule.id == rule_id)
    }

    pub fn has_enabled_path_only_rule(&self) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.enabled && rule.protection_mode == ProtectionMode::PathOnly)
    }
}
