//! Direct enforcement records pushed to the engine's local API

use serde::{Deserialize, Serialize};

/// Whether the decision targets a single address or a CIDR range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionScope {
    Ip,
    Range,
}

impl DecisionScope {
    /// Scope name in the engine's vocabulary
    pub fn as_engine_str(&self) -> &'static str {
        match self {
            DecisionScope::Ip => "Ip",
            DecisionScope::Range => "Range",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Ban,
    Captcha,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Ban => "ban",
            DecisionKind::Captcha => "captcha",
        }
    }
}

/// Decision built from an `ip_ban` rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Address or CIDR range, already validated
    pub ip: String,
    pub scope: DecisionScope,
    #[serde(rename = "type")]
    pub kind: DecisionKind,
    pub duration_seconds: u64,
    /// Stable per rule, used as the dedupe key together with `ip`
    pub reason: String,
}

impl Decision {
    /// Engine duration literal, e.g. `3600s`
    pub fn duration_literal(&self) -> String {
        format!("{}s", self.duration_seconds)
    }

    /// Dedupe key shared by identical submissions
    pub fn dedupe_key(&self) -> (&str, &str) {
        (&self.ip, &self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_wire_format() {
        let decision = Decision {
            ip: "5.6.7.8".to_string(),
            scope: DecisionScope::Ip,
            kind: DecisionKind::Ban,
            duration_seconds: 3600,
            reason: "bastion/abc/rule-3".to_string(),
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["ip"], "5.6.7.8");
        assert_eq!(json["durationSeconds"], 3600);
        assert_eq!(json["type"], "ban");
        assert_eq!(decision.duration_literal(), "3600s");
    }
}
