//! Bastion Common - shared data model between the rule compiler, the
//! deployment service and the server bootstrapper.
//!
//! Everything here is plain data: no I/O, no clocks other than the
//! timestamps callers hand in.

pub mod decision;
pub mod rule;
pub mod server;
pub mod traffic;

pub use decision::{Decision, DecisionKind, DecisionScope};
pub use rule::{
    Application, Condition, FirewallConfig, FirewallRule, LogicalOperator, ProtectionMode,
    RuleAction,
};
pub use server::{Component, ComponentHealth, ProvisioningState, SecurityStatus, Server, ServerId};
pub use traffic::{TrafficMetrics, TrafficMetricsError, TrafficOutcome};

/// Default ban duration applied when a config does not override it (4 hours)
pub const DEFAULT_BAN_DURATION_SECONDS: u64 = 14_400;
