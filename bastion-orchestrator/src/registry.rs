//! Server registry with field-scoped status updates
//!
//! Installer and validator jobs complete concurrently on the same server.
//! Each write goes through a [`StatusUpdate`] applied under the entry lock
//! and touches only the flags that update owns, so concurrent branches
//! never lose each other's results.

use bastion_common::{Component, ComponentHealth, ProvisioningState, Server, ServerId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{Result, SecurityError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Install outcome of one component
    Installed { component: Component, installed: bool },
    /// Payload inspection availability, owned by the engine install
    AppSecAvailable(bool),
    /// One component's validation outcome
    Validated { component: Component, health: ComponentHealth },
    /// Validation pass summary
    ValidationCompleted { validated: bool, at: DateTime<Utc> },
    State(ProvisioningState),
}

#[derive(Default)]
pub struct ServerRegistry {
    servers: DashMap<ServerId, Server>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, server: Server) {
        info!(server_id = server.id, server = %server.name, "Server registered");
        self.servers.insert(server.id, server);
    }

    pub fn get(&self, server_id: ServerId) -> Result<Server> {
        self.servers
            .get(&server_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SecurityError::NotFound(format!("server {}", server_id)))
    }

    pub fn list(&self) -> Vec<Server> {
        let mut servers: Vec<Server> = self.servers.iter().map(|e| e.value().clone()).collect();
        servers.sort_by_key(|s| s.id);
        servers
    }

    /// Apply one update atomically and return the resulting server
    pub fn apply(&self, server_id: ServerId, update: StatusUpdate) -> Result<Server> {
        let mut entry = self
            .servers
            .get_mut(&server_id)
            .ok_or_else(|| SecurityError::NotFound(format!("server {}", server_id)))?;
        let server = entry.value_mut();

        match &update {
            StatusUpdate::Installed { component, installed } => {
                component.apply_flags(&mut server.status, *installed);
            }
            StatusUpdate::AppSecAvailable(available) => {
                server.status.appsec_available = *available && server.status.crowdsec_available;
            }
            StatusUpdate::Validated { component, health } => {
                component.apply_flags(&mut server.status, health.healthy);
                server
                    .status
                    .validation_details
                    .insert(component.as_str().to_string(), health.clone());
            }
            StatusUpdate::ValidationCompleted { validated, at } => {
                server.status.installation_validated = *validated;
                server.status.last_validation_at = Some(*at);
            }
            StatusUpdate::State(state) => {
                server.state = *state;
            }
        }

        debug!(server_id, ?update, "Server status updated");
        Ok(server.clone())
    }

    /// Write all servers as JSON, replacing the file atomically
    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.list())?;
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, json)?;
        std::fs::rename(&staging, path)?;
        debug!(path = %path.display(), "Server registry snapshot written");
        Ok(())
    }

    /// Load servers written by [`ServerRegistry::write_snapshot`]; a missing
    /// file yields an empty registry
    pub fn load_snapshot(path: &Path) -> Result<Self> {
        let registry = Self::new();
        match std::fs::read(path) {
            Ok(bytes) => {
                let servers: Vec<Server> = serde_json::from_slice(&bytes)?;
                info!(count = servers.len(), path = %path.display(), "Server registry restored");
                for server in servers {
                    registry.servers.insert(server.id, server);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "No server registry snapshot found, starting empty");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry_with_server() -> ServerRegistry {
        let registry = ServerRegistry::new();
        registry.insert(Server::new(1, "edge-1", "10.0.0.1"));
        registry
    }

    #[test]
    fn test_unknown_server() {
        let registry = ServerRegistry::new();
        assert!(matches!(registry.get(9), Err(SecurityError::NotFound(_))));
        assert!(registry
            .apply(9, StatusUpdate::AppSecAvailable(true))
            .is_err());
    }

    #[test]
    fn test_appsec_requires_engine() {
        let registry = registry_with_server();
        let server = registry.apply(1, StatusUpdate::AppSecAvailable(true)).unwrap();
        assert!(!server.status.appsec_available);

        registry
            .apply(1, StatusUpdate::Installed { component: Component::CrowdSec, installed: true })
            .unwrap();
        let server = registry.apply(1, StatusUpdate::AppSecAvailable(true)).unwrap();
        assert!(server.status.appsec_available);
    }

    #[test]
    fn test_validation_records_details() {
        let registry = registry_with_server();
        let server = registry
            .apply(
                1,
                StatusUpdate::Validated {
                    component: Component::TrafficLogger,
                    health: ComponentHealth::unhealthy("health endpoint refused"),
                },
            )
            .unwrap();
        assert!(!server.status.traffic_logger_installed);
        assert_eq!(
            server.status.validation_details["traffic_logger"].message,
            "health endpoint refused"
        );
    }

    #[test]
    fn test_concurrent_branches_do_not_lose_updates() {
        let registry = Arc::new(registry_with_server());
        let handles: Vec<_> = Component::INSTALLABLE
            .into_iter()
            .map(|component| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry
                            .apply(1, StatusUpdate::Installed { component, installed: true })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let status = registry.get(1).unwrap().status;
        assert!(status.missing_components().is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let registry = registry_with_server();
        registry
            .apply(1, StatusUpdate::Installed { component: Component::HeaderLogging, installed: true })
            .unwrap();
        registry
            .apply(1, StatusUpdate::State(ProvisioningState::Failed(Component::CrowdSec)))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        registry.write_snapshot(&path).unwrap();

        let restored = ServerRegistry::load_snapshot(&path).unwrap();
        assert_eq!(restored.get(1).unwrap(), registry.get(1).unwrap());
        assert!(ServerRegistry::load_snapshot(&dir.path().join("missing.json"))
            .unwrap()
            .list()
            .is_empty());
    }
}
