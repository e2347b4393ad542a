//! Server Security Bootstrapper
//!
//! A new server gets a staggered plan of independent install jobs on the
//! security queue. Each branch retries on its own schedule and writes only
//! its own status flags, so one component's failure never blocks or rolls
//! back another. A validation pass runs last and never reinstalls.
//!
//! When a server becomes reachable later, every component still missing is
//! installed immediately on the high priority queue. Each dispatch of an
//! install takes a fresh ticket for its (server, component) pair: a queued
//! job holding an older ticket stands down when it runs, and a pair whose
//! install is currently running is not dispatched again.

pub mod installers;
pub mod validator;

use async_trait::async_trait;
use bastion_common::{Component, ProvisioningState, ServerId};
use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::BootstrapConfig;
use crate::error::{Result, SecurityError};
use crate::events::{EventBus, ServerEvent};
use crate::hooks::FailureHook;
use crate::registry::{ServerRegistry, StatusUpdate};
use crate::scheduler::{Job, JobOptions, JobScheduler, Queue, RetryPolicy};

pub use installers::{ComponentInstaller, InstallerSet};
pub use validator::ValidationJob;

// ============================================================================
// Plan
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct InstallStep {
    pub component: Component,
    /// Delay after server creation
    pub offset: Duration,
    pub retry: RetryPolicy,
    pub queue: Queue,
}

/// Declarative install schedule, one step per component plus validation
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapPlan {
    steps: Vec<InstallStep>,
}

impl BootstrapPlan {
    pub fn from_config(config: &BootstrapConfig) -> Self {
        let step = |component, offset_seconds, retry| InstallStep {
            component,
            offset: Duration::from_secs(offset_seconds),
            retry,
            queue: Queue::Security,
        };

        Self {
            steps: vec![
                step(Component::CrowdSec, config.crowdsec_offset_seconds, config.crowdsec_retry()),
                step(
                    Component::RequestLogging,
                    config.request_logging_offset_seconds,
                    RetryPolicy::single_attempt(),
                ),
                step(
                    Component::HeaderLogging,
                    config.header_logging_offset_seconds,
                    RetryPolicy::single_attempt(),
                ),
                step(
                    Component::LogShipping,
                    config.log_shipping_offset_seconds,
                    RetryPolicy::single_attempt(),
                ),
                step(
                    Component::TrafficLogger,
                    config.traffic_logger_offset_seconds,
                    RetryPolicy::single_attempt(),
                ),
                step(
                    Component::Validator,
                    config.validation_offset_seconds,
                    RetryPolicy::single_attempt(),
                ),
            ],
        }
    }

    pub fn steps(&self) -> &[InstallStep] {
        &self.steps
    }

    pub fn step(&self, component: Component) -> Option<&InstallStep> {
        self.steps.iter().find(|s| s.component == component)
    }
}

// ============================================================================
// Bootstrapper
// ============================================================================

pub struct SecurityBootstrapper {
    registry: Arc<ServerRegistry>,
    installers: InstallerSet,
    scheduler: JobScheduler,
    plan: BootstrapPlan,
    failure_hook: Arc<dyn FailureHook>,
    revalidate_after: Duration,
    max_revalidations: u32,
    claims: DashMap<(ServerId, Component), InstallClaim>,
    next_ticket: AtomicU64,
}

/// Newest install dispatched for a (server, component) pair
#[derive(Debug, Clone, Copy)]
struct InstallClaim {
    ticket: u64,
    running: bool,
}

impl SecurityBootstrapper {
    pub fn new(
        registry: Arc<ServerRegistry>,
        installers: InstallerSet,
        scheduler: JobScheduler,
        config: &BootstrapConfig,
        failure_hook: Arc<dyn FailureHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            installers,
            scheduler,
            plan: BootstrapPlan::from_config(config),
            failure_hook,
            revalidate_after: config.revalidate_after(),
            max_revalidations: config.max_revalidations,
            claims: DashMap::new(),
            next_ticket: AtomicU64::new(0),
        })
    }

    pub fn plan(&self) -> &BootstrapPlan {
        &self.plan
    }

    pub(crate) fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub(crate) fn installers(&self) -> &InstallerSet {
        &self.installers
    }

    /// Consume server events until the bus goes away
    pub fn spawn(self: &Arc<Self>, bus: &EventBus<ServerEvent>) -> JoinHandle<()> {
        let mut subscription = bus.subscribe();
        let bootstrapper = self.clone();
        tokio::spawn(async move {
            info!("Security bootstrapper listening for server events");
            while let Some(event) = subscription.recv().await {
                let outcome = match &event {
                    ServerEvent::Created { server_id } => bootstrapper.on_server_created(*server_id),
                    ServerEvent::BecameReachable { server_id } => {
                        bootstrapper.on_server_reachable(*server_id)
                    }
                };
                if let Err(e) = outcome {
                    warn!(?event, error = %e, "Server event ignored");
                }
            }
        })
    }

    /// Schedule the full plan. Returns the components scheduled.
    #[instrument(skip(self))]
    pub fn on_server_created(self: &Arc<Self>, server_id: ServerId) -> Result<Vec<Component>> {
        let server = self
            .registry
            .apply(server_id, StatusUpdate::State(ProvisioningState::Requested))?;

        let mut scheduled = Vec::new();
        for step in self.plan.steps() {
            if step.component != Component::Validator
                && step.component.is_installed(&server.status)
            {
                info!(component = %step.component, "Already installed, skipping");
                continue;
            }
            let options = JobOptions::on(step.queue)
                .delay(step.offset)
                .retry(step.retry.clone());
            if self.dispatch_step(server_id, step.component, options) {
                scheduled.push(step.component);
            }
        }

        info!(
            server_id,
            components = ?scheduled,
            "Security bootstrap scheduled"
        );
        Ok(scheduled)
    }

    /// Install every missing component now, ahead of the staggered plan.
    /// Components with an install already running are left to it. Returns
    /// the components dispatched.
    #[instrument(skip(self))]
    pub fn on_server_reachable(self: &Arc<Self>, server_id: ServerId) -> Result<Vec<Component>> {
        let server = self.registry.get(server_id)?;

        let mut dispatched = Vec::new();
        for component in server.status.missing_components() {
            let retry = self
                .plan
                .step(component)
                .map(|s| s.retry.clone())
                .unwrap_or_else(RetryPolicy::single_attempt);
            if self.dispatch_step(server_id, component, JobOptions::on(Queue::High).retry(retry)) {
                dispatched.push(component);
            } else {
                info!(server_id, component = %component, "Install already running");
            }
        }

        if !dispatched.is_empty() {
            info!(server_id, components = ?dispatched, "Missing components re-triggered");
        }
        Ok(dispatched)
    }

    /// Returns false when an install of the component is already running
    fn dispatch_step(self: &Arc<Self>, server_id: ServerId, component: Component, options: JobOptions) -> bool {
        let job: Arc<dyn Job> = match component {
            Component::Validator => Arc::new(ValidationJob::new(self.clone(), server_id, 0)),
            component => match self.claim(server_id, component) {
                Some(ticket) => Arc::new(InstallJob {
                    bootstrapper: self.clone(),
                    server_id,
                    component,
                    ticket,
                }),
                None => return false,
            },
        };
        self.scheduler.dispatch(job, options);
        true
    }

    /// New ticket for the pair, superseding any queued install
    fn claim(&self, server_id: ServerId, component: Component) -> Option<u64> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let mut claim = self
            .claims
            .entry((server_id, component))
            .or_insert(InstallClaim { ticket, running: false });
        if claim.running {
            return None;
        }
        claim.ticket = ticket;
        Some(ticket)
    }

    /// Mark the install running if `ticket` is still the newest
    fn begin_install(&self, server_id: ServerId, component: Component, ticket: u64) -> bool {
        match self.claims.get_mut(&(server_id, component)) {
            Some(mut claim) if claim.ticket == ticket => {
                claim.running = true;
                true
            }
            _ => false,
        }
    }

    /// A failed attempt stays claimed but no longer running, so a reachable
    /// server can take over before the retry fires
    fn pause_install(&self, server_id: ServerId, component: Component, ticket: u64) {
        if let Some(mut claim) = self.claims.get_mut(&(server_id, component)) {
            if claim.ticket == ticket {
                claim.running = false;
            }
        }
    }

    fn release_install(&self, server_id: ServerId, component: Component, ticket: u64) {
        self.claims
            .remove_if(&(server_id, component), |_, claim| claim.ticket == ticket);
    }

    pub(crate) fn schedule_revalidation(self: &Arc<Self>, server_id: ServerId, completed_round: u32) -> bool {
        if completed_round >= self.max_revalidations {
            warn!(server_id, rounds = completed_round, "Re-validation limit reached");
            return false;
        }
        self.scheduler.dispatch(
            Arc::new(ValidationJob::new(self.clone(), server_id, completed_round + 1)),
            JobOptions::on(Queue::Security).delay(self.revalidate_after),
        );
        true
    }

    /// Record a permanent install failure: own flags down, state failed,
    /// failure hook notified
    async fn record_failure(&self, server_id: ServerId, component: Component, error: &SecurityError) {
        counter!("bastion_component_failures_total", 1, "component" => component.as_str());

        let updates = [
            StatusUpdate::Installed {
                component,
                installed: false,
            },
            StatusUpdate::State(ProvisioningState::Failed(component)),
        ];
        let mut server = None;
        for update in updates {
            match self.registry.apply(server_id, update) {
                Ok(updated) => server = Some(updated),
                Err(e) => {
                    error!(server_id, component = %component, error = %e, "Cannot record install failure");
                    return;
                }
            }
        }

        if let Some(server) = server {
            self.failure_hook
                .on_permanent_failure(&server, component, error)
                .await;
        }
    }
}

// ============================================================================
// Install job
// ============================================================================

pub struct InstallJob {
    bootstrapper: Arc<SecurityBootstrapper>,
    server_id: ServerId,
    component: Component,
    ticket: u64,
}

impl InstallJob {
    async fn install(&self, attempt: u32) -> Result<()> {
        let installer = self.bootstrapper.installers.get(self.component).ok_or_else(|| {
            SecurityError::Configuration(format!("no installer for {}", self.component))
        })?;
        let registry = &self.bootstrapper.registry;

        let server = registry.apply(
            self.server_id,
            StatusUpdate::State(ProvisioningState::Installing(self.component)),
        )?;
        info!(
            server_id = self.server_id,
            component = %self.component,
            attempt,
            "Installing component"
        );

        let extra = installer.install(&server).await?;

        registry.apply(
            self.server_id,
            StatusUpdate::Installed {
                component: self.component,
                installed: true,
            },
        )?;
        for update in extra {
            registry.apply(self.server_id, update)?;
        }

        counter!("bastion_component_installs_total", 1, "component" => self.component.as_str());
        info!(
            server_id = self.server_id,
            component = %self.component,
            attempt,
            "Component installed"
        );
        Ok(())
    }
}

#[async_trait]
impl Job for InstallJob {
    fn name(&self) -> String {
        format!("install-{}-server-{}", self.component, self.server_id)
    }

    async fn handle(&self, attempt: u32) -> Result<()> {
        let bootstrapper = &self.bootstrapper;
        let server = bootstrapper.registry.get(self.server_id)?;
        if self.component.is_installed(&server.status) {
            info!(server_id = self.server_id, component = %self.component, "Already installed");
            bootstrapper.release_install(self.server_id, self.component, self.ticket);
            return Ok(());
        }
        if !bootstrapper.begin_install(self.server_id, self.component, self.ticket) {
            info!(server_id = self.server_id, component = %self.component, "Superseded by a newer install");
            return Ok(());
        }

        let result = self.install(attempt).await;
        match &result {
            Ok(()) => bootstrapper.release_install(self.server_id, self.component, self.ticket),
            Err(_) => bootstrapper.pause_install(self.server_id, self.component, self.ticket),
        }
        result
    }

    async fn failed(&self, error: &SecurityError) {
        error!(
            server_id = self.server_id,
            component = %self.component,
            error = %error,
            "Component install failed permanently"
        );
        self.bootstrapper
            .release_install(self.server_id, self.component, self.ticket);
        self.bootstrapper
            .record_failure(self.server_id, self.component, error)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_offsets_and_policies() {
        let plan = BootstrapPlan::from_config(&BootstrapConfig::default());
        let offsets: Vec<(Component, u64)> = plan
            .steps()
            .iter()
            .map(|s| (s.component, s.offset.as_secs()))
            .collect();

        assert_eq!(
            offsets,
            vec![
                (Component::CrowdSec, 120),
                (Component::RequestLogging, 150),
                (Component::HeaderLogging, 165),
                (Component::LogShipping, 180),
                (Component::TrafficLogger, 240),
                (Component::Validator, 480),
            ]
        );
        assert!(plan.steps().iter().all(|s| s.queue == Queue::Security));

        let crowdsec = plan.step(Component::CrowdSec).unwrap();
        assert_eq!(crowdsec.retry.tries, 3);
        assert_eq!(crowdsec.retry.retry_window, Some(Duration::from_secs(3600)));
        assert_eq!(plan.step(Component::TrafficLogger).unwrap().retry.tries, 1);
    }
}
