//! In-memory fakes for the remote collaborators

#![allow(dead_code)]

use async_trait::async_trait;
use bastion_common::{
    Application, Component, ComponentHealth, Condition, Decision, FirewallConfig, FirewallRule,
    LogicalOperator, ProtectionMode, RuleAction, Server, ServerId,
};
use bastion_orchestrator::bootstrap::ComponentInstaller;
use bastion_orchestrator::compiler::{RuleCompiler, ScenarioFile};
use bastion_orchestrator::config::ScenarioConfig;
use bastion_orchestrator::engine::{EngineAlert, EngineApi, EngineDecision};
use bastion_orchestrator::error::{Result, SecurityError};
use bastion_orchestrator::events::{EventBus, RuleEvent};
use bastion_orchestrator::hooks::{DeploymentTrigger, FailureHook};
use bastion_orchestrator::registry::{ServerRegistry, StatusUpdate};
use bastion_orchestrator::scenario_store::{ScenarioStore, StillCurrent};
use bastion_orchestrator::store::FirewallStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub const APP_UUID: &str = "abc";
pub const SERVER_ID: ServerId = 7;

// ============================================================================
// Fixtures
// ============================================================================

pub fn active_config() -> FirewallConfig {
    FirewallConfig {
        id: 10,
        application_id: 0,
        enabled: true,
        api_key: "lapi-key".to_string(),
        ban_duration: 3600,
        appsec_enabled: false,
        inband_enabled: false,
        bouncer_name: Some(format!("app-{}", APP_UUID)),
    }
}

pub fn application() -> Application {
    Application {
        id: 100,
        uuid: APP_UUID.to_string(),
        name: "shop".to_string(),
        server_id: SERVER_ID,
    }
}

pub fn rule(name: &str, mode: ProtectionMode, conditions: Vec<Condition>) -> FirewallRule {
    FirewallRule {
        id: 0,
        config_id: 0,
        name: name.to_string(),
        description: None,
        protection_mode: mode,
        action: RuleAction::Ban,
        enabled: true,
        logical_operator: LogicalOperator::And,
        conditions,
        priority: 0,
        remediation_duration: None,
    }
}

/// Store with one application on one registered server
pub fn seeded_store(config: FirewallConfig) -> (Arc<FirewallStore>, Arc<EventBus<RuleEvent>>) {
    seeded_store_on(config, Arc::new(EventBus::new()))
}

/// Same as [`seeded_store`], publishing on the given bus
pub fn seeded_store_on(
    config: FirewallConfig,
    bus: Arc<EventBus<RuleEvent>>,
) -> (Arc<FirewallStore>, Arc<EventBus<RuleEvent>>) {
    let registry = Arc::new(ServerRegistry::new());
    registry.insert(Server::new(SERVER_ID, "edge-1", "10.0.0.7"));
    let store = Arc::new(FirewallStore::new(
        RuleCompiler::new(ScenarioConfig::default()),
        registry,
        bus.clone(),
    ));
    store
        .register_application(application(), config)
        .expect("fixture application registers");
    (store, bus)
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Default)]
pub struct FakeEngine {
    decisions: Mutex<Vec<EngineDecision>>,
    next_id: AtomicU64,
    pub created: AtomicUsize,
    pub reloads: AtomicUsize,
    pub bouncer_reloads: AtomicUsize,
    /// Loaded scenario names, as `cscli scenarios list` reports them
    pub scenarios: Mutex<Vec<String>>,
    pub alerts: Mutex<Vec<EngineAlert>>,
    /// (name, requested key) per registration
    pub bouncers: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeEngine {
    pub fn decisions(&self) -> Vec<EngineDecision> {
        self.decisions.lock().unwrap().clone()
    }

    pub fn with_alerts(alerts: Vec<EngineAlert>) -> Self {
        Self {
            alerts: Mutex::new(alerts),
            ..Default::default()
        }
    }

    pub fn bouncers(&self) -> Vec<(String, Option<String>)> {
        self.bouncers.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineApi for FakeEngine {
    async fn create_decision(&self, _server: &Server, decision: &Decision) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.decisions.lock().unwrap().push(EngineDecision {
            id,
            origin: "cscli".to_string(),
            kind: decision.kind.as_str().to_string(),
            scope: decision.scope.as_engine_str().to_string(),
            value: decision.ip.clone(),
            duration: decision.duration_literal(),
            scenario: decision.reason.clone(),
        });
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_decisions(&self, _server: &Server, ip: &str) -> Result<Vec<EngineDecision>> {
        Ok(self
            .decisions
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.value == ip)
            .cloned()
            .collect())
    }

    async fn delete_decision(&self, _server: &Server, decision_id: u64) -> Result<()> {
        self.decisions.lock().unwrap().retain(|d| d.id != decision_id);
        Ok(())
    }

    async fn list_scenarios(&self, _server: &Server) -> Result<Vec<String>> {
        Ok(self.scenarios.lock().unwrap().clone())
    }

    async fn list_alerts(&self, _server: &Server, _since_hours: u64) -> Result<Vec<EngineAlert>> {
        Ok(self.alerts.lock().unwrap().clone())
    }

    async fn register_bouncer(&self, _server: &Server, name: &str, api_key: Option<&str>) -> Result<String> {
        self.bouncers
            .lock()
            .unwrap()
            .push((name.to_string(), api_key.map(str::to_string)));
        Ok(api_key.map(str::to_string).unwrap_or_else(|| format!("issued-{}", name)))
    }

    async fn reload(&self, _server: &Server) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reload_bouncer_cache(&self, _server: &Server) -> Result<()> {
        self.bouncer_reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Scenario store
// ============================================================================

#[derive(Default)]
pub struct MemoryScenarioStore {
    files: Mutex<HashMap<(ServerId, String), Vec<ScenarioFile>>>,
    pub replacements: AtomicUsize,
}

impl MemoryScenarioStore {
    pub fn files(&self, server_id: ServerId, app_uuid: &str) -> Vec<ScenarioFile> {
        self.files
            .lock()
            .unwrap()
            .get(&(server_id, app_uuid.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn file_names(&self, server_id: ServerId, app_uuid: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .files(server_id, app_uuid)
            .into_iter()
            .map(|f| f.file_name)
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ScenarioStore for MemoryScenarioStore {
    async fn replace_all(
        &self,
        server: &Server,
        app_uuid: &str,
        files: &[ScenarioFile],
        is_current: StillCurrent<'_>,
    ) -> Result<bool> {
        if !is_current() {
            return Ok(false);
        }
        self.files
            .lock()
            .unwrap()
            .insert((server.id, app_uuid.to_string()), files.to_vec());
        self.replacements.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn list(&self, server: &Server, app_uuid: &str) -> Result<Vec<String>> {
        Ok(self.file_names(server.id, app_uuid))
    }
}

// ============================================================================
// Hooks
// ============================================================================

#[derive(Default)]
pub struct RecordingTrigger {
    pub calls: Mutex<Vec<(u64, bool)>>,
}

impl RecordingTrigger {
    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl DeploymentTrigger for RecordingTrigger {
    async fn enqueue_deployment(
        &self,
        application_id: u64,
        _correlation_id: Uuid,
        force_rebuild: bool,
    ) -> Result<()> {
        self.calls.lock().unwrap().push((application_id, force_rebuild));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingFailureHook {
    pub failures: Mutex<Vec<(ServerId, Component, String)>>,
}

impl RecordingFailureHook {
    pub fn failures(&self) -> Vec<(ServerId, Component, String)> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl FailureHook for RecordingFailureHook {
    async fn on_permanent_failure(&self, server: &Server, component: Component, error: &SecurityError) {
        self.failures
            .lock()
            .unwrap()
            .push((server.id, component, error.to_string()));
    }
}

// ============================================================================
// Installers
// ============================================================================

/// Installer that fails its first `failures` attempts with a transport error
pub struct ScriptedInstaller {
    component: Component,
    failures: usize,
    healthy: bool,
    extra: Vec<StatusUpdate>,
    latency: Duration,
    started: Instant,
    attempts: Mutex<Vec<Duration>>,
    validations: AtomicUsize,
}

impl ScriptedInstaller {
    pub fn succeeding(component: Component) -> Self {
        Self::new(component, 0, true)
    }

    pub fn always_failing(component: Component) -> Self {
        Self::new(component, usize::MAX, false)
    }

    pub fn new(component: Component, failures: usize, healthy: bool) -> Self {
        Self {
            component,
            failures,
            healthy,
            extra: Vec::new(),
            latency: Duration::ZERO,
            started: Instant::now(),
            attempts: Mutex::new(Vec::new()),
            validations: AtomicUsize::new(0),
        }
    }

    pub fn with_extra(mut self, update: StatusUpdate) -> Self {
        self.extra.push(update);
        self
    }

    /// Each attempt takes `latency` before it resolves
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Attempt times relative to construction
    pub fn attempts(&self) -> Vec<Duration> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn validations(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComponentInstaller for ScriptedInstaller {
    fn component(&self) -> Component {
        self.component
    }

    async fn install(&self, _server: &Server) -> Result<Vec<StatusUpdate>> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(self.started.elapsed());
            attempts.len()
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if attempt <= self.failures {
            return Err(SecurityError::Transport(format!(
                "{} install attempt {} failed",
                self.component, attempt
            )));
        }
        Ok(self.extra.clone())
    }

    async fn validate(&self, _server: &Server) -> ComponentHealth {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if self.healthy {
            ComponentHealth::healthy("ok")
        } else {
            ComponentHealth::unhealthy("not running")
        }
    }
}
