use thiserror::Error;

/// Errors raised while compiling rules or provisioning servers
#[derive(Error, Debug)]
pub enum SecurityError {
    /// Feature disabled or credential missing; callers skip silently
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed rule, rejected at save time
    #[error("Compilation error: {0}")]
    Compilation(#[from] CompilationError),

    /// Remote exec, upload or HTTP failure; retried by the owning job
    #[error("Transport error: {0}")]
    Transport(String),

    /// Post-install check failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Retry budget or deadline exhausted
    #[error("Permanent failure: {0}")]
    PermanentFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using SecurityError
pub type Result<T> = std::result::Result<T, SecurityError>;

impl SecurityError {
    /// Only transport failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, SecurityError::Transport(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, SecurityError::Configuration(_))
    }
}

impl From<std::io::Error> for SecurityError {
    fn from(err: std::io::Error) -> Self {
        SecurityError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SecurityError {
    fn from(err: serde_json::Error) -> Self {
        SecurityError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SecurityError {
    fn from(err: serde_yaml::Error) -> Self {
        SecurityError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for SecurityError {
    fn from(err: reqwest::Error) -> Self {
        SecurityError::Transport(err.to_string())
    }
}

/// Why a rule could not be compiled
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompilationError {
    #[error("rule {rule_id} has no conditions")]
    EmptyConditions { rule_id: u64 },

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("empty value for field '{0}'")]
    EmptyValue(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("rule {rule_id}: negated conditions need at least one positive condition joined with AND")]
    SoleNegation { rule_id: u64 },

    #[error("invalid application uuid '{0}'")]
    InvalidApplicationUuid(String),

    #[error("invalid ban target '{0}'")]
    InvalidBanTarget(String),

    #[error("ip_ban rules only accept ip_address equals conditions, got {field} {operator}")]
    UnsupportedBanCondition { field: String, operator: String },

    #[error("rule {rule_id}: an address cannot equal several ban targets at once, use OR or one comma separated list")]
    ConflictingBanTargets { rule_id: u64 },
}
