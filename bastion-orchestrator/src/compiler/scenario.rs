// Scenario Generator - composes compiled conditions and the isolation
// guard into a named leaky-bucket scenario for the engine

use bastion_common::{FirewallRule, RuleAction};
use serde::Serialize;
use std::collections::BTreeMap;

use super::condition::{check_negation_policy, compile_condition, quote, CompiledCondition};
use crate::error::CompilationError;

/// Remediation applied when the scenario overflows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Remediation {
    pub action: RuleAction,
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scenario {
    pub name: String,
    pub description: String,
    pub filter: String,
    pub metadata: BTreeMap<String, String>,
    pub remediation: Remediation,
    /// File name on the server, unique per application and rule
    pub file_name: String,
}

/// Lowercase slug, runs of anything else collapsed to a single dash
pub fn sanitize(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "rule".to_string()
    } else {
        slug
    }
}

/// Application uuids are inlined into the guard and paths, so only a safe
/// alphabet is accepted
pub fn validate_app_uuid(app_uuid: &str) -> Result<(), CompilationError> {
    let valid = !app_uuid.is_empty()
        && app_uuid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CompilationError::InvalidApplicationUuid(app_uuid.to_string()))
    }
}

/// Guard matching only traffic routed to the application, on two
/// independent signals
pub fn isolation_guard(app_uuid: &str) -> String {
    let literal = quote(app_uuid);
    format!(
        "(evt.Meta.traefik_router_name contains {literal} || evt.Meta.http_host contains {literal})"
    )
}

pub fn scenario_name(namespace: &str, app_uuid: &str, rule: &FirewallRule) -> String {
    format!("{}/{}/{}-{}", namespace, app_uuid, sanitize(&rule.name), rule.id)
}

/// `<uuid>.<slug>-<id>.yaml`; the dot cannot occur in a uuid, so the
/// prefix identifies the owning application unambiguously
pub fn scenario_file_name(app_uuid: &str, rule: &FirewallRule) -> String {
    format!("{}.{}-{}.yaml", app_uuid, sanitize(&rule.name), rule.id)
}

pub fn generate(
    namespace: &str,
    app_uuid: &str,
    rule: &FirewallRule,
    duration_seconds: u64,
) -> Result<Scenario, CompilationError> {
    validate_app_uuid(app_uuid)?;

    if rule.conditions.is_empty() {
        return Err(CompilationError::EmptyConditions { rule_id: rule.id });
    }

    let compiled = rule
        .conditions
        .iter()
        .map(compile_condition)
        .collect::<Result<Vec<CompiledCondition>, _>>()?;
    check_negation_policy(rule.id, &compiled, rule.logical_operator)?;

    let body = compiled
        .iter()
        .map(|c| c.expression.as_str())
        .collect::<Vec<_>>()
        .join(rule.logical_operator.joiner());

    let filter = format!(
        "evt.Parsed.program == 'traefik' && {} && ({})",
        isolation_guard(app_uuid),
        body
    );

    let mut metadata = BTreeMap::new();
    metadata.insert("app_uuid".to_string(), app_uuid.to_string());
    metadata.insert("rule_id".to_string(), rule.id.to_string());
    metadata.insert("rule_name".to_string(), rule.name.clone());
    metadata.insert(
        "protection_mode".to_string(),
        rule.protection_mode.as_str().to_string(),
    );

    let description = rule
        .description
        .clone()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| format!("Firewall rule: {}", rule.name));

    Ok(Scenario {
        name: scenario_name(namespace, app_uuid, rule),
        description,
        filter,
        metadata,
        remediation: Remediation {
            action: rule.action,
            duration_seconds,
        },
        file_name: scenario_file_name(app_uuid, rule),
    })
}

// ============================================================================
// YAML rendering
// ============================================================================

#[derive(Serialize)]
struct ScenarioDocument<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'a str,
    description: &'a str,
    filter: &'a str,
    groupby: &'static str,
    capacity: u32,
    leakspeed: &'a str,
    blackhole: String,
    labels: ScenarioLabels<'a>,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct ScenarioLabels<'a> {
    service: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    remediation: bool,
    remediation_type: &'static str,
    remediation_duration: u64,
    app_uuid: &'a str,
}

impl Scenario {
    pub fn app_uuid(&self) -> Option<&str> {
        self.metadata.get("app_uuid").map(String::as_str)
    }

    /// Render the engine's scenario document
    pub fn to_yaml(&self, capacity: u32, leakspeed: &str) -> Result<String, serde_yaml::Error> {
        let document = ScenarioDocument {
            kind: "leaky",
            name: &self.name,
            description: &self.description,
            filter: &self.filter,
            groupby: "evt.Meta.source_ip",
            capacity,
            leakspeed,
            blackhole: format!("{}s", self.remediation.duration_seconds),
            labels: ScenarioLabels {
                service: "http",
                kind: "firewall_rule",
                remediation: true,
                remediation_type: self.remediation.action.as_str(),
                remediation_duration: self.remediation.duration_seconds,
                app_uuid: self.app_uuid().unwrap_or_default(),
            },
            metadata: &self.metadata,
        };
        serde_yaml::to_string(&document)
    }
}
