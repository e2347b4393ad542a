//! Traffic metrics aggregation and Prometheus metric descriptions

use bastion_common::{TrafficMetrics, TrafficMetricsError, TrafficOutcome};
use dashmap::DashMap;
use metrics::{counter, describe_counter, describe_gauge};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One request outcome reported by a traffic logger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub app_uuid: String,
    /// Bouncer remediation applied to the request, absent when allowed
    #[serde(default)]
    pub remediation: Option<String>,
}

impl TrafficRecord {
    pub fn outcome(&self) -> TrafficOutcome {
        TrafficOutcome::from_remediation(self.remediation.as_deref())
    }
}

#[derive(Default)]
struct OutcomeCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
    challenged: AtomicU64,
}

impl OutcomeCounters {
    fn slot(&self, outcome: TrafficOutcome) -> &AtomicU64 {
        match outcome {
            TrafficOutcome::Allowed => &self.allowed,
            TrafficOutcome::Denied => &self.denied,
            TrafficOutcome::Challenged => &self.challenged,
        }
    }
}

/// Lock-free per application outcome counters
#[derive(Default)]
pub struct TrafficMetricsCollector {
    apps: DashMap<String, Arc<OutcomeCounters>>,
}

impl TrafficMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, app_uuid: &str, outcome: TrafficOutcome) {
        let counters = self
            .apps
            .entry(app_uuid.to_string())
            .or_default()
            .clone();
        counters.slot(outcome).fetch_add(1, Ordering::Relaxed);
        counter!("bastion_traffic_requests_total", 1, "outcome" => outcome.as_str());
    }

    /// Record a batch, returns the number of records accepted
    pub fn ingest(&self, records: &[TrafficRecord]) -> usize {
        for record in records {
            self.record(&record.app_uuid, record.outcome());
        }
        records.len()
    }

    /// Current totals for one application, zero when nothing was reported
    pub fn snapshot(&self, app_uuid: &str) -> Result<TrafficMetrics, TrafficMetricsError> {
        let Some(counters) = self.apps.get(app_uuid).map(|e| e.value().clone()) else {
            return Ok(TrafficMetrics::default());
        };
        TrafficMetrics::new(
            counters.allowed.load(Ordering::Relaxed),
            counters.denied.load(Ordering::Relaxed),
            counters.challenged.load(Ordering::Relaxed),
        )
    }
}

/// Register descriptions for every metric the orchestrator emits
pub fn describe_metrics() {
    describe_counter!("bastion_rules_compiled_total", "Rules compiled successfully");
    describe_counter!(
        "bastion_compilation_errors_total",
        "Rules rejected by the condition compiler"
    );
    describe_counter!(
        "bastion_scenarios_uploaded_total",
        "Scenario files uploaded to managed servers"
    );
    describe_counter!(
        "bastion_decisions_created_total",
        "Ban decisions submitted to the engine"
    );
    describe_counter!(
        "bastion_bouncers_provisioned_total",
        "Application bouncers registered on the engine"
    );
    describe_counter!(
        "bastion_alerts_synced_total",
        "Engine alerts attributed to an application and recorded"
    );
    describe_counter!("bastion_jobs_total", "Background jobs by outcome");
    describe_counter!(
        "bastion_component_installs_total",
        "Security components installed, by component"
    );
    describe_counter!(
        "bastion_component_failures_total",
        "Security component installs that failed permanently, by component"
    );
    describe_counter!("bastion_validations_total", "Installation validation passes by outcome");
    describe_counter!(
        "bastion_traffic_requests_total",
        "Proxied requests reported by traffic loggers, by outcome"
    );
    describe_gauge!("bastion_servers_total", "Servers in the registry");
    describe_gauge!("bastion_servers_validated", "Servers whose installation is validated");
    describe_gauge!("bastion_jobs_pending", "Jobs queued, delayed or running");
}
