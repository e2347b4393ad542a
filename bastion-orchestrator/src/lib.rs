//! Bastion Orchestrator
//!
//! Compiles per-application firewall rules into engine scenarios, ban
//! decisions and proxy middleware labels, deploys them to managed servers,
//! bootstraps the security stack on newly created servers and collects the
//! alerts the engine raises.

pub mod alerts;
pub mod api;
pub mod audit;
pub mod bootstrap;
pub mod compiler;
pub mod config;
pub mod context;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod events;
pub mod hooks;
pub mod labels;
pub mod metrics;
pub mod registry;
pub mod remote;
pub mod scenario_store;
pub mod scheduler;
pub mod store;
pub mod templates;

pub use error::{CompilationError, Result, SecurityError};
