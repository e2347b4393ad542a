//! Engine alert sync
//!
//! Alerts raised by the engine on every server running it are pulled on a
//! fixed interval and attributed to applications, through the `app_uuid`
//! metadata the compiled scenarios carry or, failing that, through the
//! `<namespace>/<app_uuid>/` prefix of the scenario or ban reason. Alerts
//! that cannot be attributed to an application on the same server are
//! dropped. Repeats of one (source ip, scenario) pair for an application
//! inside the dedupe window count as one alert.

use async_trait::async_trait;
use bastion_common::{Application, Server, ServerId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::AlertsConfig;
use crate::engine::{EngineAlert, EngineApi, EngineDecision};
use crate::error::Result;
use crate::scheduler::{Job, JobOptions, JobScheduler, Queue, RetryPolicy};
use crate::store::FirewallStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    SqlInjection,
    XssAttack,
    PortScan,
    BruteForce,
    PathTraversal,
    RemoteCodeExecution,
    SuspiciousBot,
    RateLimitExceeded,
    SuspiciousActivity,
}

impl AlertType {
    /// Classify by keywords in the scenario name, first match wins
    pub fn from_scenario(scenario: &str) -> Self {
        const KEYWORDS: [(&[&str], AlertType); 8] = [
            (&["sql-injection", "sqli"], AlertType::SqlInjection),
            (&["xss", "cross-site"], AlertType::XssAttack),
            (&["scan", "recon"], AlertType::PortScan),
            (&["brute", "password"], AlertType::BruteForce),
            (&["path-traversal", "directory"], AlertType::PathTraversal),
            (&["rce", "remote-code"], AlertType::RemoteCodeExecution),
            (&["bot", "crawler"], AlertType::SuspiciousBot),
            (&["rate", "flood"], AlertType::RateLimitExceeded),
        ];
        let scenario = scenario.to_ascii_lowercase();
        KEYWORDS
            .iter()
            .find(|(words, _)| words.iter().any(|w| scenario.contains(w)))
            .map(|(_, kind)| *kind)
            .unwrap_or(AlertType::SuspiciousActivity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    /// The first ban or captcha decides: a ban of a day or more is critical,
    /// any other ban high, a captcha medium. No remediation is low.
    pub fn from_decisions(decisions: &[EngineDecision]) -> Self {
        for decision in decisions {
            match decision.kind.as_str() {
                "ban" if duration_hours(&decision.duration) >= 24 => return AlertSeverity::Critical,
                "ban" => return AlertSeverity::High,
                "captcha" => return AlertSeverity::Medium,
                _ => {}
            }
        }
        AlertSeverity::Low
    }
}

/// Whole hours of an engine duration literal such as `167h59m58s`
fn duration_hours(literal: &str) -> u64 {
    literal
        .split_once('h')
        .and_then(|(hours, _)| hours.trim().parse().ok())
        .unwrap_or(0)
}

/// Alert attributed to one application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallAlert {
    /// Assigned when recorded
    pub id: u64,
    pub application_id: u64,
    pub app_uuid: String,
    pub server_id: ServerId,
    pub engine_alert_id: u64,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub ip_address: String,
    pub scenario: String,
    pub message: String,
    pub decisions: usize,
    pub observed_at: DateTime<Utc>,
}

impl FirewallAlert {
    /// `None` when the engine alert names no source address
    pub fn from_engine(
        alert: &EngineAlert,
        application: &Application,
        server_id: ServerId,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let ip = alert.source_ip()?.to_string();
        let scenario = if alert.scenario.is_empty() {
            "unknown".to_string()
        } else {
            alert.scenario.clone()
        };
        let decisions = alert.decisions();

        let mut message = format!("Suspicious activity detected from IP {}", ip);
        if scenario != "unknown" {
            message.push_str(&format!(" ({})", scenario));
        }
        if !decisions.is_empty() {
            message.push_str(&format!(". {} decision(s) applied.", decisions.len()));
        }

        Some(Self {
            id: 0,
            application_id: application.id,
            app_uuid: application.uuid.clone(),
            server_id,
            engine_alert_id: alert.id,
            alert_type: AlertType::from_scenario(&scenario),
            severity: AlertSeverity::from_decisions(decisions),
            ip_address: ip,
            scenario,
            message,
            decisions: decisions.len(),
            observed_at: alert.created_at.unwrap_or(now),
        })
    }
}

/// Recent alerts per application, oldest dropped past the cap
pub struct AlertStore {
    by_app: DashMap<String, VecDeque<FirewallAlert>>,
    next_id: AtomicU64,
    dedupe_window: chrono::Duration,
    max_per_application: usize,
}

impl AlertStore {
    pub fn new(settings: &AlertsConfig) -> Self {
        Self {
            by_app: DashMap::new(),
            next_id: AtomicU64::new(0),
            dedupe_window: settings.dedupe_window(),
            max_per_application: settings.max_per_application.max(1),
        }
    }

    /// Store the alert unless it was seen already or repeats a recent one
    pub fn record(&self, mut alert: FirewallAlert) -> Option<FirewallAlert> {
        let mut entries = self.by_app.entry(alert.app_uuid.clone()).or_default();

        let seen = alert.engine_alert_id != 0
            && entries
                .iter()
                .any(|a| a.server_id == alert.server_id && a.engine_alert_id == alert.engine_alert_id);
        if seen {
            return None;
        }
        let repeated = entries.iter().any(|a| {
            let gap = if a.observed_at > alert.observed_at {
                a.observed_at - alert.observed_at
            } else {
                alert.observed_at - a.observed_at
            };
            a.ip_address == alert.ip_address && a.scenario == alert.scenario && gap < self.dedupe_window
        });
        if repeated {
            debug!(ip = %alert.ip_address, scenario = %alert.scenario, "Repeated alert suppressed");
            return None;
        }

        alert.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        entries.push_back(alert.clone());
        while entries.len() > self.max_per_application {
            entries.pop_front();
        }
        Some(alert)
    }

    /// Newest first
    pub fn for_application(&self, app_uuid: &str) -> Vec<FirewallAlert> {
        self.by_app
            .get(app_uuid)
            .map(|entries| entries.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}

/// Application owning a namespaced scenario or ban reason
pub fn scenario_owner<'a>(namespace: &str, scenario: &'a str) -> Option<&'a str> {
    let rest = scenario.strip_prefix(namespace)?.strip_prefix('/')?;
    let (app_uuid, _) = rest.split_once('/')?;
    (!app_uuid.is_empty()).then_some(app_uuid)
}

pub struct AlertSync {
    store: Arc<FirewallStore>,
    engine: Arc<dyn EngineApi>,
    alerts: Arc<AlertStore>,
    scheduler: JobScheduler,
    settings: AlertsConfig,
}

impl AlertSync {
    pub fn new(
        store: Arc<FirewallStore>,
        engine: Arc<dyn EngineApi>,
        alerts: Arc<AlertStore>,
        scheduler: JobScheduler,
        settings: AlertsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            alerts,
            scheduler,
            settings,
        })
    }

    /// Dispatch a sync job every interval
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let sync = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(sync.settings.sync_interval());
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            info!(interval_seconds = sync.settings.sync_interval_seconds, "Alert sync scheduled");
            loop {
                interval.tick().await;
                sync.scheduler.dispatch(
                    Arc::new(SyncAlertsJob { sync: sync.clone() }),
                    JobOptions::on(Queue::Default).retry(RetryPolicy::single_attempt()),
                );
            }
        })
    }

    /// Pull alerts from every server running the engine. A failing server
    /// is logged and skipped. Returns the number of alerts recorded.
    pub async fn sync_once(&self) -> usize {
        let servers: Vec<Server> = self
            .store
            .servers()
            .list()
            .into_iter()
            .filter(|s| s.status.crowdsec_installed && s.status.crowdsec_available)
            .collect();

        let mut recorded = 0usize;
        for server in &servers {
            let alerts = match self.engine.list_alerts(server, self.settings.lookback_hours).await {
                Ok(alerts) => alerts,
                Err(e) => {
                    warn!(server_id = server.id, error = %e, "Failed to pull engine alerts");
                    continue;
                }
            };
            let now = Utc::now();
            for alert in &alerts {
                if self.ingest(server, alert, now).is_some() {
                    recorded += 1;
                }
            }
        }

        counter!("bastion_alerts_synced_total", recorded as u64);
        info!(servers = servers.len(), recorded, "Engine alerts synced");
        recorded
    }

    fn ingest(&self, server: &Server, alert: &EngineAlert, now: DateTime<Utc>) -> Option<FirewallAlert> {
        let Some(application) = self.resolve_application(server, alert) else {
            debug!(engine_alert_id = alert.id, scenario = %alert.scenario, "Alert not attributable");
            return None;
        };
        let candidate = FirewallAlert::from_engine(alert, &application, server.id, now)?;
        let recorded = self.alerts.record(candidate)?;
        debug!(
            app_uuid = %recorded.app_uuid,
            alert_type = ?recorded.alert_type,
            ip = %recorded.ip_address,
            "Alert recorded"
        );
        Some(recorded)
    }

    fn resolve_application(&self, server: &Server, alert: &EngineAlert) -> Option<Application> {
        let namespace = self.store.compiler().namespace();
        let app_uuid = alert
            .meta_value("app_uuid")
            .or_else(|| scenario_owner(namespace, &alert.scenario))
            .or_else(|| {
                alert
                    .decisions()
                    .iter()
                    .find_map(|d| scenario_owner(namespace, &d.scenario))
            })?;
        let application = self.store.application(app_uuid).ok()?;
        (application.server_id == server.id).then_some(application)
    }
}

pub struct SyncAlertsJob {
    sync: Arc<AlertSync>,
}

#[async_trait]
impl Job for SyncAlertsJob {
    fn name(&self) -> String {
        "sync-engine-alerts".to_string()
    }

    async fn handle(&self, _attempt: u32) -> Result<()> {
        self.sync.sync_once().await;
        Ok(())
    }
}
