//! Integration tests for the server security bootstrapper
//!
//! All tests run on paused tokio time, so the staggered plan and the retry
//! backoff are observed at their exact offsets.

mod common;

use bastion_common::{Component, ProvisioningState, Server};
use bastion_orchestrator::bootstrap::{ComponentInstaller, InstallerSet, SecurityBootstrapper};
use bastion_orchestrator::config::BootstrapConfig;
use bastion_orchestrator::registry::{ServerRegistry, StatusUpdate};
use bastion_orchestrator::scheduler::JobScheduler;
use common::*;
use std::sync::Arc;
use std::time::Duration;

const MINUTE: u64 = 60;

struct Harness {
    registry: Arc<ServerRegistry>,
    bootstrapper: Arc<SecurityBootstrapper>,
    scheduler: JobScheduler,
    hook: Arc<RecordingFailureHook>,
    installers: Vec<Arc<ScriptedInstaller>>,
}

impl Harness {
    fn new(installers: Vec<ScriptedInstaller>) -> Self {
        Self::with_config(installers, BootstrapConfig::default())
    }

    fn with_config(installers: Vec<ScriptedInstaller>, config: BootstrapConfig) -> Self {
        let registry = Arc::new(ServerRegistry::new());
        registry.insert(Server::new(SERVER_ID, "edge-1", "10.0.0.7"));

        let installers: Vec<Arc<ScriptedInstaller>> = installers.into_iter().map(Arc::new).collect();
        let set = installers
            .iter()
            .fold(InstallerSet::new(), |set, installer| set.with(installer.clone()));

        let scheduler = JobScheduler::start(4);
        let hook = Arc::new(RecordingFailureHook::default());
        let bootstrapper = SecurityBootstrapper::new(
            registry.clone(),
            set,
            scheduler.clone(),
            &config,
            hook.clone(),
        );
        Self {
            registry,
            bootstrapper,
            scheduler,
            hook,
            installers,
        }
    }

    fn installer(&self, component: Component) -> &ScriptedInstaller {
        self.installers
            .iter()
            .find(|i| i.component() == component)
            .expect("installer registered")
    }

    fn server(&self) -> Server {
        self.registry.get(SERVER_ID).unwrap()
    }
}

fn all_succeeding() -> Vec<ScriptedInstaller> {
    Component::INSTALLABLE
        .into_iter()
        .map(|component| {
            let installer = ScriptedInstaller::succeeding(component);
            if component == Component::CrowdSec {
                installer.with_extra(StatusUpdate::AppSecAvailable(true))
            } else {
                installer
            }
        })
        .collect()
}

#[cfg(test)]
mod plan_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_components_install_at_planned_offsets() {
        let harness = Harness::new(all_succeeding());
        let scheduled = harness.bootstrapper.on_server_created(SERVER_ID).unwrap();
        assert_eq!(scheduled.len(), 6);

        harness.scheduler.idle().await;

        let expected = [
            (Component::CrowdSec, 120),
            (Component::RequestLogging, 150),
            (Component::HeaderLogging, 165),
            (Component::LogShipping, 180),
            (Component::TrafficLogger, 240),
        ];
        for (component, offset) in expected {
            assert_eq!(
                harness.installer(component).attempts(),
                vec![Duration::from_secs(offset)],
                "{}",
                component
            );
        }

        let server = harness.server();
        assert!(server.status.crowdsec_installed);
        assert!(server.status.crowdsec_available);
        assert!(server.status.appsec_available);
        assert!(server.status.traefik_logging_enabled);
        assert!(server.status.header_logging_enabled);
        assert!(server.status.log_shipping_configured);
        assert!(server.status.traffic_logger_installed);
        assert!(server.status.installation_validated);
        assert!(server.status.last_validation_at.is_some());
        assert_eq!(server.status.validation_details.len(), 5);
        assert_eq!(server.state, ProvisioningState::Validated);
        assert!(harness.hook.failures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_installed_components_are_not_rescheduled() {
        let harness = Harness::new(all_succeeding());
        harness
            .registry
            .apply(
                SERVER_ID,
                StatusUpdate::Installed {
                    component: Component::CrowdSec,
                    installed: true,
                },
            )
            .unwrap();

        let scheduled = harness.bootstrapper.on_server_created(SERVER_ID).unwrap();
        assert!(!scheduled.contains(&Component::CrowdSec));
        assert!(scheduled.contains(&Component::Validator));

        harness.scheduler.idle().await;
        assert!(harness.installer(Component::CrowdSec).attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_server_is_rejected() {
        let harness = Harness::new(all_succeeding());
        assert!(harness.bootstrapper.on_server_created(404).is_err());
        assert_eq!(harness.scheduler.pending(), 0);
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;

    fn crowdsec_down() -> Vec<ScriptedInstaller> {
        Component::INSTALLABLE
            .into_iter()
            .map(|component| {
                if component == Component::CrowdSec {
                    ScriptedInstaller::always_failing(component)
                } else {
                    ScriptedInstaller::succeeding(component)
                }
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_crowdsec_exhausts_retries_on_schedule() {
        let harness = Harness::new(crowdsec_down());
        harness.bootstrapper.on_server_created(SERVER_ID).unwrap();

        tokio::time::sleep(Duration::from_secs(17 * MINUTE)).await;

        let crowdsec = harness.installer(Component::CrowdSec);
        assert_eq!(
            crowdsec.attempts(),
            vec![
                Duration::from_secs(2 * MINUTE),
                Duration::from_secs(3 * MINUTE),
                Duration::from_secs(8 * MINUTE),
            ]
        );

        let server = harness.server();
        assert!(!server.status.crowdsec_installed);
        assert!(!server.status.crowdsec_available);
        assert!(!server.status.appsec_available);

        let failures = harness.hook.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, SERVER_ID);
        assert_eq!(failures[0].1, Component::CrowdSec);
        assert!(failures[0].2.contains("Permanent failure"));

        tokio::time::sleep(Duration::from_secs(62 * MINUTE)).await;
        assert_eq!(crowdsec.attempts().len(), 3);
        assert_eq!(harness.hook.failures().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_branch_failure_does_not_touch_others() {
        let harness = Harness::new(crowdsec_down());
        harness.bootstrapper.on_server_created(SERVER_ID).unwrap();

        tokio::time::sleep(Duration::from_secs(5 * MINUTE)).await;

        let server = harness.server();
        assert!(server.status.traefik_logging_enabled);
        assert!(server.status.header_logging_enabled);
        assert!(server.status.log_shipping_configured);
        assert!(server.status.traffic_logger_installed);
        assert!(!server.status.crowdsec_installed);
        assert_eq!(harness.installer(Component::TrafficLogger).attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_component_fails_once() {
        let installers = Component::INSTALLABLE
            .into_iter()
            .map(|component| {
                if component == Component::TrafficLogger {
                    ScriptedInstaller::always_failing(component)
                } else {
                    ScriptedInstaller::succeeding(component)
                }
            })
            .collect();
        let harness = Harness::new(installers);
        harness.bootstrapper.on_server_created(SERVER_ID).unwrap();

        tokio::time::sleep(Duration::from_secs(7 * MINUTE)).await;

        let server = harness.server();
        assert!(!server.status.traffic_logger_installed);
        assert!(server.status.crowdsec_installed);
        assert_eq!(server.state, ProvisioningState::Failed(Component::TrafficLogger));
        assert_eq!(harness.installer(Component::TrafficLogger).attempts().len(), 1);
        assert_eq!(harness.hook.failures().len(), 1);
    }
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_failed_validation_revalidates_without_reinstalling() {
        let installers = Component::INSTALLABLE
            .into_iter()
            .map(|component| {
                if component == Component::TrafficLogger {
                    // Installs fine but never becomes healthy
                    ScriptedInstaller::new(component, 0, false)
                } else {
                    ScriptedInstaller::succeeding(component)
                }
            })
            .collect();
        let harness = Harness::new(installers);
        harness.bootstrapper.on_server_created(SERVER_ID).unwrap();

        harness.scheduler.idle().await;

        let logger = harness.installer(Component::TrafficLogger);
        // Planned pass plus three re-validations
        assert_eq!(logger.validations(), 4);
        assert_eq!(logger.attempts().len(), 1);

        let server = harness.server();
        assert!(!server.status.installation_validated);
        assert!(!server.status.traffic_logger_installed);
        assert!(server.status.crowdsec_installed);
        assert!(!server.status.validation_details["traffic_logger"].healthy);
        assert!(server.status.validation_details["crowdsec"].healthy);
        assert_eq!(server.state, ProvisioningState::Failed(Component::TrafficLogger));
    }

    #[tokio::test(start_paused = true)]
    async fn test_revalidation_limit_is_configurable() {
        let installers = Component::INSTALLABLE
            .into_iter()
            .map(|component| ScriptedInstaller::new(component, 0, component != Component::LogShipping))
            .collect();
        let config = BootstrapConfig {
            max_revalidations: 1,
            ..BootstrapConfig::default()
        };
        let harness = Harness::with_config(installers, config);
        harness.bootstrapper.on_server_created(SERVER_ID).unwrap();

        harness.scheduler.idle().await;
        assert_eq!(harness.installer(Component::LogShipping).validations(), 2);
    }
}

#[cfg(test)]
mod reachable_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reachable_server_installs_missing_components_immediately() {
        let harness = Harness::new(all_succeeding());
        harness
            .registry
            .apply(
                SERVER_ID,
                StatusUpdate::Installed {
                    component: Component::RequestLogging,
                    installed: true,
                },
            )
            .unwrap();

        let missing = harness.bootstrapper.on_server_reachable(SERVER_ID).unwrap();
        assert_eq!(missing.len(), 4);
        assert!(!missing.contains(&Component::RequestLogging));

        tokio::time::sleep(Duration::from_secs(1)).await;

        for component in missing {
            assert_eq!(
                harness.installer(component).attempts(),
                vec![Duration::ZERO],
                "{}",
                component
            );
        }
        assert!(harness.installer(Component::RequestLogging).attempts().is_empty());
        assert!(harness.server().status.traffic_logger_installed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reachable_after_creation_installs_each_component_once() {
        let harness = Harness::new(all_succeeding());
        harness.bootstrapper.on_server_created(SERVER_ID).unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let dispatched = harness.bootstrapper.on_server_reachable(SERVER_ID).unwrap();
        assert_eq!(dispatched.len(), 5);

        harness.scheduler.idle().await;

        for component in Component::INSTALLABLE {
            assert_eq!(
                harness.installer(component).attempts(),
                vec![Duration::from_secs(10)],
                "{}",
                component
            );
        }
        let server = harness.server();
        assert!(server.status.crowdsec_installed);
        assert!(server.status.installation_validated);
        assert_eq!(server.state, ProvisioningState::Validated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_install_is_not_dispatched_again() {
        let installers = Component::INSTALLABLE
            .into_iter()
            .map(|component| {
                let installer = ScriptedInstaller::succeeding(component);
                if component == Component::CrowdSec {
                    installer.with_latency(Duration::from_secs(30))
                } else {
                    installer
                }
            })
            .collect();
        let harness = Harness::new(installers);

        let first = harness.bootstrapper.on_server_reachable(SERVER_ID).unwrap();
        assert!(first.contains(&Component::CrowdSec));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!harness.server().status.crowdsec_installed);

        let second = harness.bootstrapper.on_server_reachable(SERVER_ID).unwrap();
        assert!(second.is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            harness.installer(Component::CrowdSec).attempts(),
            vec![Duration::ZERO]
        );
        assert!(harness.server().status.crowdsec_installed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fully_installed_server_needs_nothing() {
        let harness = Harness::new(all_succeeding());
        for component in Component::INSTALLABLE {
            harness
                .registry
                .apply(SERVER_ID, StatusUpdate::Installed { component, installed: true })
                .unwrap();
        }
        assert!(harness.bootstrapper.on_server_reachable(SERVER_ID).unwrap().is_empty());
        assert_eq!(harness.scheduler.pending(), 0);
    }
}
