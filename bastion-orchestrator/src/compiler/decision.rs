// Decision Builder - ip_ban rules become direct engine decisions and never
// pass through the condition compiler

use bastion_common::{Decision, DecisionKind, DecisionScope, FirewallRule, LogicalOperator, RuleAction};
use ipnet::IpNet;
use std::net::IpAddr;

use super::condition::{Field, Operator};
use crate::error::CompilationError;

/// Reason attached to every decision of a rule; also the dedupe key
pub fn ban_reason(namespace: &str, app_uuid: &str, rule_id: u64) -> String {
    format!("{}/{}/rule-{}", namespace, app_uuid, rule_id)
}

fn parse_target(raw: &str) -> Result<(String, DecisionScope), CompilationError> {
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok((ip.to_string(), DecisionScope::Ip));
    }
    match raw.parse::<IpNet>() {
        Ok(net) if net.prefix_len() == net.max_prefix_len() => {
            Ok((net.addr().to_string(), DecisionScope::Ip))
        }
        Ok(net) => Ok((net.trunc().to_string(), DecisionScope::Range)),
        Err(_) => Err(CompilationError::InvalidBanTarget(raw.to_string())),
    }
}

/// Build one decision per distinct address or range named by the rule.
///
/// Only `ip_address equals <ip>[, <ip>...]` conditions are accepted; a
/// negated ban target would block everything else and is refused. Targets
/// within one condition and across OR-joined conditions add up. Several
/// conditions joined with AND can never hold together and are refused.
pub fn build_decisions(
    namespace: &str,
    app_uuid: &str,
    rule: &FirewallRule,
    duration_seconds: u64,
) -> Result<Vec<Decision>, CompilationError> {
    if rule.conditions.is_empty() {
        return Err(CompilationError::EmptyConditions { rule_id: rule.id });
    }
    if rule.logical_operator == LogicalOperator::And && rule.conditions.len() > 1 {
        return Err(CompilationError::ConflictingBanTargets { rule_id: rule.id });
    }

    let kind = match rule.action {
        RuleAction::Ban => DecisionKind::Ban,
        RuleAction::Captcha => DecisionKind::Captcha,
    };
    let reason = ban_reason(namespace, app_uuid, rule.id);

    let mut decisions: Vec<Decision> = Vec::new();
    for condition in &rule.conditions {
        let field: Result<Field, _> = condition.field.trim().parse();
        let operator: Result<Operator, _> = condition.operator.trim().parse();
        if !matches!((field, operator), (Ok(Field::SourceIp), Ok(Operator::Equals))) {
            return Err(CompilationError::UnsupportedBanCondition {
                field: condition.field.clone(),
                operator: condition.operator.clone(),
            });
        }

        let mut targets = condition
            .value
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .peekable();
        if targets.peek().is_none() {
            return Err(CompilationError::EmptyValue(condition.field.clone()));
        }

        for raw in targets {
            let (ip, scope) = parse_target(raw)?;
            let decision = Decision {
                ip,
                scope,
                kind,
                duration_seconds,
                reason: reason.clone(),
            };
            if !decisions.contains(&decision) {
                decisions.push(decision);
            }
        }
    }

    Ok(decisions)
}
