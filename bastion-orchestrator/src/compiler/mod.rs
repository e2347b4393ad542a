//! Rule compilation
//!
//! `ip_ban` rules become [`Decision`]s; every other protection mode becomes
//! a [`Scenario`] guarded by the owning application's uuid. Compilation is
//! pure and synchronous so the repository can reject bad rules at save time.

pub mod condition;
pub mod decision;
pub mod scenario;

use bastion_common::{Decision, FirewallConfig, FirewallRule};
use metrics::counter;
use serde::Serialize;
use tracing::debug;

use crate::config::ScenarioConfig;
use crate::context::DeploymentContext;
use crate::error::CompilationError;

pub use condition::{compile_condition, CompiledCondition, Field, Operator};
pub use decision::{ban_reason, build_decisions};
pub use scenario::{sanitize, Scenario};

/// Output of compiling a single rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledRule {
    Scenario(Scenario),
    Decisions(Vec<Decision>),
}

/// A scenario ready for upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioFile {
    pub file_name: String,
    pub contents: String,
}

#[derive(Debug, Clone)]
pub struct RuleCompiler {
    settings: ScenarioConfig,
}

impl RuleCompiler {
    pub fn new(settings: ScenarioConfig) -> Self {
        Self { settings }
    }

    pub fn namespace(&self) -> &str {
        &self.settings.namespace
    }

    pub fn compile(
        &self,
        app_uuid: &str,
        rule: &FirewallRule,
        config: &FirewallConfig,
    ) -> Result<CompiledRule, CompilationError> {
        let duration = rule.duration_seconds(config);
        let compiled = if rule.is_ip_ban() {
            scenario::validate_app_uuid(app_uuid)?;
            build_decisions(&self.settings.namespace, app_uuid, rule, duration)
                .map(CompiledRule::Decisions)
        } else {
            scenario::generate(&self.settings.namespace, app_uuid, rule, duration)
                .map(CompiledRule::Scenario)
        };

        match &compiled {
            Ok(_) => counter!("bastion_rules_compiled_total", 1),
            Err(e) => {
                debug!(rule_id = rule.id, error = %e, "Rule failed to compile");
                counter!("bastion_compilation_errors_total", 1);
            }
        }
        compiled
    }

    /// Scenarios for every enabled non-ip_ban rule, or the first error
    pub fn compile_rule_set(
        &self,
        ctx: &DeploymentContext,
    ) -> Result<Vec<Scenario>, CompilationError> {
        ctx.scenario_rules()
            .map(|rule| {
                scenario::generate(
                    &self.settings.namespace,
                    ctx.app_uuid(),
                    rule,
                    rule.duration_seconds(&ctx.config),
                )
            })
            .collect()
    }

    /// Decisions for one ip_ban rule of the context
    pub fn decisions(
        &self,
        ctx: &DeploymentContext,
        rule: &FirewallRule,
    ) -> Result<Vec<Decision>, CompilationError> {
        scenario::validate_app_uuid(ctx.app_uuid())?;
        build_decisions(
            &self.settings.namespace,
            ctx.app_uuid(),
            rule,
            rule.duration_seconds(&ctx.config),
        )
    }

    pub fn ban_reason(&self, app_uuid: &str, rule_id: u64) -> String {
        ban_reason(&self.settings.namespace, app_uuid, rule_id)
    }

    pub fn render(&self, scenario: &Scenario) -> Result<ScenarioFile, serde_yaml::Error> {
        Ok(ScenarioFile {
            file_name: scenario.file_name.clone(),
            contents: scenario.to_yaml(self.settings.capacity, &self.settings.leakspeed)?,
        })
    }
}
