//! Installation Validator - confirms each component independently

use async_trait::async_trait;
use bastion_common::{Component, ComponentHealth, ProvisioningState, ServerId};
use chrono::Utc;
use futures::future::join_all;
use metrics::counter;
use std::sync::Arc;
use tracing::{info, warn};

use super::SecurityBootstrapper;
use crate::error::Result;
use crate::registry::StatusUpdate;
use crate::scheduler::Job;

/// One validation pass. Round 0 is the planned pass, later rounds are
/// re-validations after a failed check.
pub struct ValidationJob {
    bootstrapper: Arc<SecurityBootstrapper>,
    server_id: ServerId,
    round: u32,
}

impl ValidationJob {
    pub fn new(bootstrapper: Arc<SecurityBootstrapper>, server_id: ServerId, round: u32) -> Self {
        Self {
            bootstrapper,
            server_id,
            round,
        }
    }
}

#[async_trait]
impl Job for ValidationJob {
    fn name(&self) -> String {
        format!("validate-server-{}-round-{}", self.server_id, self.round)
    }

    async fn handle(&self, _attempt: u32) -> Result<()> {
        let registry = self.bootstrapper.registry();
        let server = registry.apply(
            self.server_id,
            StatusUpdate::State(ProvisioningState::Validating),
        )?;

        // Checks run concurrently; each writes only its own component's flags
        let checks = Component::INSTALLABLE.into_iter().map(|component| {
            let installer = self.bootstrapper.installers().get(component);
            let server = &server;
            async move {
                let health = match installer {
                    Some(installer) => installer.validate(server).await,
                    None => ComponentHealth::unhealthy("no installer registered"),
                };
                (component, health)
            }
        });
        let results = join_all(checks).await;

        let mut first_failure: Option<Component> = None;
        for (component, health) in results {
            if health.healthy {
                info!(server_id = self.server_id, component = %component, "Component healthy");
            } else {
                warn!(
                    server_id = self.server_id,
                    component = %component,
                    message = %health.message,
                    "Component validation failed"
                );
                first_failure.get_or_insert(component);
            }
            registry.apply(self.server_id, StatusUpdate::Validated { component, health })?;
        }

        let validated = first_failure.is_none();
        registry.apply(
            self.server_id,
            StatusUpdate::ValidationCompleted {
                validated,
                at: Utc::now(),
            },
        )?;

        let state = match first_failure {
            None => ProvisioningState::Validated,
            Some(component) => ProvisioningState::Failed(component),
        };
        registry.apply(self.server_id, StatusUpdate::State(state))?;
        counter!(
            "bastion_validations_total", 1,
            "outcome" => if validated { "validated" } else { "failed" }
        );

        if validated {
            info!(server_id = self.server_id, round = self.round, "Installation validated");
        } else {
            let rescheduled = self
                .bootstrapper
                .schedule_revalidation(self.server_id, self.round);
            warn!(
                server_id = self.server_id,
                round = self.round,
                rescheduled,
                "Installation not validated"
            );
        }
        Ok(())
    }
}
