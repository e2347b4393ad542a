//! Engine alert sync against a fake engine

mod common;

use bastion_common::Component;
use bastion_orchestrator::alerts::{AlertSeverity, AlertStore, AlertSync, AlertType};
use bastion_orchestrator::config::AlertsConfig;
use bastion_orchestrator::engine::EngineAlert;
use bastion_orchestrator::registry::StatusUpdate;
use bastion_orchestrator::scheduler::JobScheduler;
use bastion_orchestrator::store::FirewallStore;
use common::*;
use serde_json::json;
use std::sync::Arc;

fn engine_alert(value: serde_json::Value) -> EngineAlert {
    serde_json::from_value(value).unwrap()
}

fn pulled_alerts() -> Vec<EngineAlert> {
    vec![
        // Attributed through metadata
        engine_alert(json!({
            "id": 1,
            "scenario": "crowdsecurity/http-sqli-attempt",
            "source": {"ip": "5.6.7.8"},
            "meta": [{"key": "app_uuid", "value": "abc"}],
            "decisions": [{"id": 10, "type": "ban", "scope": "Ip", "value": "5.6.7.8", "duration": "167h59m"}]
        })),
        // Attributed through the scenario name
        engine_alert(json!({
            "id": 2,
            "scenario": "bastion/abc/block-admin-1",
            "source": {"value": "9.9.9.9"}
        })),
        // No owner
        engine_alert(json!({
            "id": 3,
            "scenario": "crowdsecurity/ssh-bf",
            "source": {"ip": "1.1.1.1"}
        })),
        // Unknown application
        engine_alert(json!({
            "id": 4,
            "scenario": "bastion/zzz/login-2",
            "source": {"ip": "2.2.2.2"}
        })),
        // No source address
        engine_alert(json!({
            "id": 5,
            "scenario": "bastion/abc/block-admin-1",
            "meta": [{"key": "app_uuid", "value": "abc"}]
        })),
    ]
}

struct Harness {
    store: Arc<FirewallStore>,
    alerts: Arc<AlertStore>,
    sync: Arc<AlertSync>,
}

impl Harness {
    fn new(engine: FakeEngine) -> Self {
        let (store, _bus) = seeded_store(active_config());
        let alerts = Arc::new(AlertStore::new(&AlertsConfig::default()));
        let sync = AlertSync::new(
            store.clone(),
            Arc::new(engine),
            alerts.clone(),
            JobScheduler::start(1),
            AlertsConfig::default(),
        );
        Self { store, alerts, sync }
    }

    fn engine_running(&self) {
        self.store
            .servers()
            .apply(
                SERVER_ID,
                StatusUpdate::Installed {
                    component: Component::CrowdSec,
                    installed: true,
                },
            )
            .unwrap();
    }
}

#[cfg(test)]
mod sync_tests {
    use super::*;

    #[tokio::test]
    async fn test_alerts_attributed_to_owning_application() {
        let harness = Harness::new(FakeEngine::with_alerts(pulled_alerts()));
        harness.engine_running();

        assert_eq!(harness.sync.sync_once().await, 2);

        let recorded = harness.alerts.for_application(APP_UUID);
        assert_eq!(recorded.len(), 2);
        let sqli = recorded.iter().find(|a| a.engine_alert_id == 1).unwrap();
        assert_eq!(sqli.alert_type, AlertType::SqlInjection);
        assert_eq!(sqli.severity, AlertSeverity::Critical);
        assert_eq!(sqli.application_id, 100);
        assert_eq!(sqli.server_id, SERVER_ID);
        let admin = recorded.iter().find(|a| a.engine_alert_id == 2).unwrap();
        assert_eq!(admin.ip_address, "9.9.9.9");
        assert_eq!(admin.severity, AlertSeverity::Low);
    }

    #[tokio::test]
    async fn test_repeated_pull_records_nothing_new() {
        let harness = Harness::new(FakeEngine::with_alerts(pulled_alerts()));
        harness.engine_running();

        assert_eq!(harness.sync.sync_once().await, 2);
        assert_eq!(harness.sync.sync_once().await, 0);
        assert_eq!(harness.alerts.for_application(APP_UUID).len(), 2);
    }

    #[tokio::test]
    async fn test_servers_without_engine_are_skipped() {
        let harness = Harness::new(FakeEngine::with_alerts(pulled_alerts()));

        assert_eq!(harness.sync.sync_once().await, 0);
        assert!(harness.alerts.for_application(APP_UUID).is_empty());
    }
}
