// Condition Compiler - turns one rule condition into a filter sub-expression
//
// Output format is `<accessor> <comparator> '<value>'`. The field and
// operator tables are total: anything not listed is a CompilationError.

use bastion_common::{Condition, LogicalOperator};
use std::fmt;
use std::str::FromStr;

use crate::error::CompilationError;

// ============================================================================
// Fields
// ============================================================================

/// Request attribute a condition can inspect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    SourceIp,
    RequestPath,
    UriFull,
    Method,
    UserAgent,
    Host,
    Referer,
    Protocol,
    CountryCode,
}

impl Field {
    /// Engine event accessor for this field
    pub fn accessor(&self) -> &'static str {
        match self {
            Field::SourceIp => "evt.Meta.source_ip",
            Field::RequestPath => "evt.Parsed.request",
            Field::UriFull => "evt.Parsed.uri",
            Field::Method => "evt.Parsed.verb",
            Field::UserAgent => "evt.Parsed.http_user_agent",
            Field::Host => "evt.Meta.target_fqdn",
            Field::Referer => "evt.Parsed.http_referer",
            Field::Protocol => "evt.Parsed.http_version",
            Field::CountryCode => "evt.Enriched.IsoCode",
        }
    }
}

impl FromStr for Field {
    type Err = CompilationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip_address" | "ip" | "source_ip" => Ok(Field::SourceIp),
            "request_path" => Ok(Field::RequestPath),
            "uri_full" => Ok(Field::UriFull),
            "method" => Ok(Field::Method),
            "user_agent" => Ok(Field::UserAgent),
            "host" => Ok(Field::Host),
            "referer" => Ok(Field::Referer),
            "protocol" => Ok(Field::Protocol),
            "country_code" => Ok(Field::CountryCode),
            other => Err(CompilationError::UnknownField(other.to_string())),
        }
    }
}

// ============================================================================
// Operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
}

impl Operator {
    /// True for operators that match everything except the value
    pub fn is_negated(&self) -> bool {
        matches!(self, Operator::NotEquals | Operator::NotContains)
    }

    fn comparator(&self) -> &'static str {
        match self {
            Operator::Equals => "==",
            Operator::NotEquals => "!=",
            Operator::Contains | Operator::NotContains => "contains",
            Operator::StartsWith => "startsWith",
            Operator::EndsWith => "endsWith",
            Operator::Regex => "matches",
        }
    }
}

impl FromStr for Operator {
    type Err = CompilationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equals" => Ok(Operator::Equals),
            "not_equals" => Ok(Operator::NotEquals),
            "contains" => Ok(Operator::Contains),
            "not_contains" => Ok(Operator::NotContains),
            "starts_with" => Ok(Operator::StartsWith),
            "ends_with" => Ok(Operator::EndsWith),
            "regex" => Ok(Operator::Regex),
            other => Err(CompilationError::UnknownOperator(other.to_string())),
        }
    }
}

// ============================================================================
// Compilation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCondition {
    pub field: Field,
    pub operator: Operator,
    pub expression: String,
}

impl fmt::Display for CompiledCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Single-quoted string literal with backslashes and quotes escaped
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

pub fn compile_condition(condition: &Condition) -> Result<CompiledCondition, CompilationError> {
    let field: Field = condition.field.trim().parse()?;
    let operator: Operator = condition.operator.trim().parse()?;

    if condition.value.trim().is_empty() {
        return Err(CompilationError::EmptyValue(condition.field.clone()));
    }

    if operator == Operator::Regex {
        regex::Regex::new(&condition.value).map_err(|e| CompilationError::InvalidPattern {
            pattern: condition.value.clone(),
            reason: e.to_string(),
        })?;
    }

    let literal = quote(&condition.value);
    let expression = match operator {
        Operator::NotContains => format!(
            "!({} {} {})",
            field.accessor(),
            operator.comparator(),
            literal
        ),
        _ => format!("{} {} {}", field.accessor(), operator.comparator(), literal),
    };

    Ok(CompiledCondition {
        field,
        operator,
        expression,
    })
}

/// Reject rules whose negated conditions would match nearly all traffic.
///
/// A negation is only allowed inside an AND rule that also carries at
/// least one positive condition narrowing the match.
pub fn check_negation_policy(
    rule_id: u64,
    compiled: &[CompiledCondition],
    logical_operator: LogicalOperator,
) -> Result<(), CompilationError> {
    let negated = compiled.iter().filter(|c| c.operator.is_negated()).count();
    if negated == 0 {
        return Ok(());
    }
    if logical_operator == LogicalOperator::Or || negated == compiled.len() {
        return Err(CompilationError::SoleNegation { rule_id });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(field: &str, operator: &str, value: &str) -> Result<CompiledCondition, CompilationError> {
        compile_condition(&Condition::new(field, operator, value))
    }

    #[test]
    fn test_operator_mapping() {
        assert_eq!(
            compile("ip_address", "equals", "1.2.3.4").unwrap().expression,
            "evt.Meta.source_ip == '1.2.3.4'"
        );
        assert_eq!(
            compile("request_path", "starts_with", "/admin").unwrap().expression,
            "evt.Parsed.request startsWith '/admin'"
        );
        assert_eq!(
            compile("user_agent", "not_contains", "curl").unwrap().expression,
            "!(evt.Parsed.http_user_agent contains 'curl')"
        );
        assert_eq!(
            compile("method", "not_equals", "GET").unwrap().expression,
            "evt.Parsed.verb != 'GET'"
        );
    }

    #[test]
    fn test_unknown_field_and_operator_rejected() {
        assert_eq!(
            compile("cookie", "equals", "x"),
            Err(CompilationError::UnknownField("cookie".to_string()))
        );
        assert_eq!(
            compile("host", "greater_than", "x"),
            Err(CompilationError::UnknownOperator("greater_than".to_string()))
        );
    }

    #[test]
    fn test_empty_value_rejected() {
        assert!(matches!(
            compile("host", "equals", "  "),
            Err(CompilationError::EmptyValue(_))
        ));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        assert!(matches!(
            compile("request_path", "regex", "(unclosed"),
            Err(CompilationError::InvalidPattern { .. })
        ));
        assert!(compile("request_path", "regex", "^/wp-(admin|login)").is_ok());
    }

    #[test]
    fn test_values_cannot_escape_literal() {
        let compiled = compile("user_agent", "contains", "x' || true || '").unwrap();
        assert_eq!(
            compiled.expression,
            "evt.Parsed.http_user_agent contains 'x\\' || true || \\''"
        );
        assert_eq!(quote("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_sole_negation_rejected() {
        let negated = vec![compile("ip_address", "not_equals", "1.2.3.4").unwrap()];
        assert_eq!(
            check_negation_policy(9, &negated, LogicalOperator::And),
            Err(CompilationError::SoleNegation { rule_id: 9 })
        );
    }

    #[test]
    fn test_negation_needs_positive_and_condition() {
        let conditions = vec![
            compile("request_path", "starts_with", "/admin").unwrap(),
            compile("ip_address", "not_equals", "10.0.0.1").unwrap(),
        ];
        assert!(check_negation_policy(1, &conditions, LogicalOperator::And).is_ok());
        assert!(check_negation_policy(1, &conditions, LogicalOperator::Or).is_err());
    }

    /// Reads a quoted literal back, failing on any unescaped quote before the end
    fn unquote(literal: &str) -> Option<String> {
        let inner = literal.strip_prefix('\'')?.strip_suffix('\'')?;
        let mut out = String::new();
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next()? {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    escaped => out.push(escaped),
                },
                '\'' => return None,
                other => out.push(other),
            }
        }
        Some(out)
    }

    proptest::proptest! {
        #[test]
        fn prop_quote_is_a_single_literal(value in ".*") {
            proptest::prop_assert_eq!(unquote(&quote(&value)), Some(value));
        }
    }
}
