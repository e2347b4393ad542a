//! Firewall repositories
//!
//! Applications, their firewall config and rules. Every rule is compiled
//! on save so a malformed rule is rejected synchronously and never reaches
//! the deployment pipeline. Mutations publish [`RuleEvent`]s.

use bastion_common::{Application, FirewallConfig, FirewallRule};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::compiler::{scenario::validate_app_uuid, RuleCompiler};
use crate::context::DeploymentContext;
use crate::error::{Result, SecurityError};
use crate::events::{EventBus, EventPublisher, RuleEvent};
use crate::registry::ServerRegistry;

/// Partial update of a firewall config
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub enabled: Option<bool>,
    pub api_key: Option<String>,
    pub ban_duration: Option<u64>,
    pub appsec_enabled: Option<bool>,
    pub inband_enabled: Option<bool>,
}

pub struct FirewallStore {
    applications: DashMap<u64, Application>,
    uuid_index: DashMap<String, u64>,
    configs: DashMap<u64, FirewallConfig>,
    config_by_application: DashMap<u64, u64>,
    rules: DashMap<u64, FirewallRule>,
    next_rule_id: AtomicU64,
    compiler: RuleCompiler,
    servers: Arc<ServerRegistry>,
    events: Arc<EventBus<RuleEvent>>,
}

impl FirewallStore {
    pub fn new(
        compiler: RuleCompiler,
        servers: Arc<ServerRegistry>,
        events: Arc<EventBus<RuleEvent>>,
    ) -> Self {
        Self {
            applications: DashMap::new(),
            uuid_index: DashMap::new(),
            configs: DashMap::new(),
            config_by_application: DashMap::new(),
            rules: DashMap::new(),
            next_rule_id: AtomicU64::new(1),
            compiler,
            servers,
            events,
        }
    }

    pub fn servers(&self) -> &Arc<ServerRegistry> {
        &self.servers
    }

    pub fn compiler(&self) -> &RuleCompiler {
        &self.compiler
    }

    /// Register an application together with its firewall config
    pub fn register_application(
        &self,
        application: Application,
        mut config: FirewallConfig,
    ) -> Result<()> {
        validate_app_uuid(&application.uuid)?;
        config.application_id = application.id;

        info!(
            application_id = application.id,
            app_uuid = %application.uuid,
            firewall_enabled = config.enabled,
            "Application registered"
        );
        self.uuid_index
            .insert(application.uuid.clone(), application.id);
        self.config_by_application.insert(application.id, config.id);
        self.configs.insert(config.id, config);
        self.applications.insert(application.id, application);
        Ok(())
    }

    pub fn application(&self, app_uuid: &str) -> Result<Application> {
        self.uuid_index
            .get(app_uuid)
            .and_then(|id| self.applications.get(id.value()).map(|a| a.value().clone()))
            .ok_or_else(|| SecurityError::NotFound(format!("application {}", app_uuid)))
    }

    pub fn config_for(&self, app_uuid: &str) -> Result<FirewallConfig> {
        let application = self.application(app_uuid)?;
        self.config_by_application
            .get(&application.id)
            .and_then(|id| self.configs.get(id.value()).map(|c| c.value().clone()))
            .ok_or_else(|| SecurityError::NotFound(format!("firewall config for {}", app_uuid)))
    }

    #[instrument(skip(self, update))]
    pub async fn update_config(&self, app_uuid: &str, update: ConfigUpdate) -> Result<FirewallConfig> {
        let config_id = self.config_for(app_uuid)?.id;
        let updated = {
            let mut entry = self
                .configs
                .get_mut(&config_id)
                .ok_or_else(|| SecurityError::NotFound(format!("firewall config {}", config_id)))?;
            let config = entry.value_mut();
            if let Some(enabled) = update.enabled {
                config.enabled = enabled;
            }
            if let Some(api_key) = update.api_key {
                if api_key != config.api_key {
                    // A new key has to be registered on the engine again
                    config.api_key = api_key;
                    config.bouncer_name = None;
                }
            }
            if let Some(ban_duration) = update.ban_duration {
                config.ban_duration = ban_duration;
            }
            if let Some(appsec_enabled) = update.appsec_enabled {
                config.appsec_enabled = appsec_enabled;
            }
            if let Some(inband_enabled) = update.inband_enabled {
                config.inband_enabled = inband_enabled;
            }
            config.clone()
        };

        info!(config_id, enabled = updated.enabled, "Firewall config updated");
        self.events
            .publish(RuleEvent::ConfigChanged { config_id })
            .await;
        Ok(updated)
    }

    /// Store the key the engine issued for an application's bouncer
    #[instrument(skip(self, api_key))]
    pub async fn record_bouncer(
        &self,
        config_id: u64,
        bouncer_name: &str,
        api_key: String,
    ) -> Result<FirewallConfig> {
        let updated = {
            let mut entry = self
                .configs
                .get_mut(&config_id)
                .ok_or_else(|| SecurityError::NotFound(format!("firewall config {}", config_id)))?;
            let config = entry.value_mut();
            config.api_key = api_key;
            config.bouncer_name = Some(bouncer_name.to_string());
            config.clone()
        };

        info!(config_id, bouncer = bouncer_name, "Bouncer key recorded");
        self.events
            .publish(RuleEvent::ConfigChanged { config_id })
            .await;
        Ok(updated)
    }

    pub fn config_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.configs.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Validate, compile and store a rule. `id == 0` creates a new rule.
    #[instrument(skip(self, rule), fields(rule_name = %rule.name))]
    pub async fn save_rule(&self, app_uuid: &str, mut rule: FirewallRule) -> Result<FirewallRule> {
        let config = self.config_for(app_uuid)?;
        rule.config_id = config.id;

        if rule.id == 0 {
            rule.id = self.next_rule_id.fetch_add(1, Ordering::SeqCst);
        } else {
            if let Some(existing) = self.rules.get(&rule.id) {
                if existing.config_id != config.id {
                    return Err(SecurityError::NotFound(format!(
                        "rule {} in application {}",
                        rule.id, app_uuid
                    )));
                }
            }
            self.next_rule_id.fetch_max(rule.id + 1, Ordering::SeqCst);
        }

        // Compilation errors reject the save; nothing is stored or published
        self.compiler.compile(app_uuid, &rule, &config)?;

        info!(
            rule_id = rule.id,
            config_id = config.id,
            protection_mode = rule.protection_mode.as_str(),
            enabled = rule.enabled,
            "Firewall rule saved"
        );
        let previous = self.rules.insert(rule.id, rule.clone());
        self.events
            .publish(RuleEvent::Saved {
                rule_id: rule.id,
                config_id: config.id,
                previous,
            })
            .await;
        Ok(rule)
    }

    #[instrument(skip(self))]
    pub async fn delete_rule(&self, app_uuid: &str, rule_id: u64) -> Result<FirewallRule> {
        let config = self.config_for(app_uuid)?;
        let (_, rule) = self
            .rules
            .remove_if(&rule_id, |_, rule| rule.config_id == config.id)
            .ok_or_else(|| SecurityError::NotFound(format!("rule {} in application {}", rule_id, app_uuid)))?;

        info!(rule_id, config_id = config.id, "Firewall rule deleted");
        self.events
            .publish(RuleEvent::Deleted {
                rule: rule.clone(),
                config_id: config.id,
            })
            .await;
        Ok(rule)
    }

    pub fn rules_for_config(&self, config_id: u64) -> Vec<FirewallRule> {
        let mut rules: Vec<FirewallRule> = self
            .rules
            .iter()
            .filter(|entry| entry.config_id == config_id)
            .map(|entry| entry.value().clone())
            .collect();
        rules.sort_by_key(|rule| (rule.priority, rule.id));
        rules
    }

    /// Assemble the deployment context for a config in one pass
    pub fn context_for_config(&self, config_id: u64) -> Result<DeploymentContext> {
        let config = self
            .configs
            .get(&config_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| SecurityError::NotFound(format!("firewall config {}", config_id)))?;
        let application = self
            .applications
            .get(&config.application_id)
            .map(|a| a.value().clone())
            .ok_or_else(|| {
                SecurityError::NotFound(format!("application {}", config.application_id))
            })?;
        let server = self.servers.get(application.server_id)?;
        let rules = self.rules_for_config(config_id);
        Ok(DeploymentContext::new(application, config, rules, server))
    }

    pub fn context_for_app(&self, app_uuid: &str) -> Result<DeploymentContext> {
        let config = self.config_for(app_uuid)?;
        self.context_for_config(config.id)
    }
}
