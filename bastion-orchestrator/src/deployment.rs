//! Rule Deployment Service
//!
//! Consumes [`RuleEvent`]s and turns them into background jobs:
//!
//! - saved `ip_ban` rule: decisions pushed straight to the engine
//! - any other save, a delete or a config change: the application's full
//!   scenario set is recompiled and replaced on its server, followed by an
//!   application redeploy (saves and config changes) and a bouncer cache
//!   reload
//! - a save that moves a rule between `ip_ban` and a scenario mode, or
//!   changes its ban targets, lifts the decisions the old version created
//! - an enabled config without a registered bouncer: the bouncer is
//!   registered on the engine first and its key stored
//!
//! A disabled config or a missing api key suppresses everything else. When
//! the subscription lags, every application is re-synced from the store.

use async_trait::async_trait;
use bastion_common::{Decision, FirewallRule, ServerId};
use dashmap::DashMap;
use metrics::counter;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::compiler::ScenarioFile;
use crate::config::DeploymentConfig;
use crate::context::DeploymentContext;
use crate::engine::EngineApi;
use crate::error::{Result, SecurityError};
use crate::events::{EventBus, Received, RuleEvent};
use crate::hooks::DeploymentTrigger;
use crate::scenario_store::ScenarioStore;
use crate::scheduler::{Job, JobOptions, JobScheduler, Queue, RetryPolicy};
use crate::store::FirewallStore;

/// Name of the engine bouncer serving one application
pub fn bouncer_name(app_uuid: &str) -> String {
    format!("app-{}", app_uuid)
}

/// What the service decided to do with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentAction {
    Skipped(String),
    BouncerProvisionScheduled { config_id: u64 },
    DecisionsScheduled { rule_id: u64 },
    DecisionRemovalScheduled { rule_id: u64, decisions: usize },
    SyncScheduled { config_id: u64, generation: u64, redeploy: bool },
}

pub struct DeploymentService {
    store: Arc<FirewallStore>,
    engine: Arc<dyn EngineApi>,
    scenarios: Arc<dyn ScenarioStore>,
    trigger: Arc<dyn DeploymentTrigger>,
    scheduler: JobScheduler,
    settings: DeploymentConfig,
    syncs: DashMap<u64, SyncState>,
}

/// Per-config sync bookkeeping. Only the newest generation runs; a redeploy
/// requested by a superseded sync is carried over to the newest one.
#[derive(Debug, Default)]
struct SyncState {
    generation: u64,
    redeploy_pending: bool,
}

impl DeploymentService {
    pub fn new(
        store: Arc<FirewallStore>,
        engine: Arc<dyn EngineApi>,
        scenarios: Arc<dyn ScenarioStore>,
        trigger: Arc<dyn DeploymentTrigger>,
        scheduler: JobScheduler,
        settings: DeploymentConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            scenarios,
            trigger,
            scheduler,
            settings,
            syncs: DashMap::new(),
        })
    }

    /// Consume rule events until the bus goes away
    pub fn spawn(self: &Arc<Self>, bus: &EventBus<RuleEvent>) -> JoinHandle<()> {
        let mut subscription = bus.subscribe();
        let service = self.clone();
        tokio::spawn(async move {
            info!("Rule deployment service listening for rule events");
            while let Some(received) = subscription.next().await {
                match received {
                    Received::Event(event) => {
                        service.handle_event(event).await;
                    }
                    Received::Lagged(missed) => {
                        let actions = service.resync_all();
                        info!(missed, scheduled = actions.len(), "Re-sync scheduled after missed rule events");
                    }
                }
            }
        })
    }

    #[instrument(skip(self))]
    pub async fn handle_event(self: &Arc<Self>, event: RuleEvent) -> Vec<DeploymentAction> {
        let ctx = match self.store.context_for_config(event.config_id()) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(error = %e, "Cannot assemble deployment context");
                return vec![DeploymentAction::Skipped(e.to_string())];
            }
        };

        if let RuleEvent::ConfigChanged { config_id } = &event {
            if ctx.config.needs_bouncer() {
                return vec![self.schedule_bouncer_provisioning(*config_id)];
            }
        }

        if !ctx.config.is_active() {
            debug!(config_id = ctx.config.id, "Firewall disabled or missing api key, skipping");
            return vec![DeploymentAction::Skipped("firewall inactive".to_string())];
        }

        match event {
            RuleEvent::Saved {
                rule_id,
                config_id,
                previous,
            } => match ctx.rule(rule_id) {
                Some(rule) => self.plan_save(&ctx, config_id, rule, previous.as_ref()),
                None => vec![DeploymentAction::Skipped(format!("rule {} no longer exists", rule_id))],
            },
            RuleEvent::Deleted { rule, config_id } => {
                let mut actions = Vec::new();
                if rule.is_ip_ban() {
                    let decisions = self.ban_decisions(&ctx, &rule);
                    actions.extend(self.schedule_decision_removal(&ctx, rule.id, decisions));
                }
                actions.push(self.schedule_sync(config_id, false));
                actions
            }
            RuleEvent::ConfigChanged { config_id } => vec![self.schedule_sync(config_id, true)],
        }
    }

    /// Jobs for one saved rule, given the version it replaced
    fn plan_save(
        self: &Arc<Self>,
        ctx: &DeploymentContext,
        config_id: u64,
        rule: &FirewallRule,
        previous: Option<&FirewallRule>,
    ) -> Vec<DeploymentAction> {
        let mut actions = Vec::new();
        let bans = rule.is_ip_ban() && rule.enabled;

        let wanted = if bans {
            self.ban_decisions(ctx, rule)
        } else {
            Vec::new()
        };
        // Decisions of the replaced version, or of this rule when it was
        // switched off without a known history
        let lifted_from = match previous {
            Some(prev) if prev.is_ip_ban() => Some(prev),
            None if rule.is_ip_ban() && !bans => Some(rule),
            _ => None,
        };
        if let Some(old) = lifted_from {
            let stale: Vec<Decision> = self
                .ban_decisions(ctx, old)
                .into_iter()
                .filter(|d| !wanted.iter().any(|w| w.ip == d.ip))
                .collect();
            actions.extend(self.schedule_decision_removal(ctx, rule.id, stale));
        }

        if bans {
            self.schedule_decisions(config_id, rule.id);
            actions.push(DeploymentAction::DecisionsScheduled { rule_id: rule.id });
        }

        let had_scenario = previous.map(|prev| !prev.is_ip_ban()).unwrap_or(false);
        if !rule.is_ip_ban() || had_scenario {
            actions.push(self.schedule_sync(config_id, true));
        }
        actions
    }

    /// Re-deploy every application from the store. Used when rule events
    /// were missed.
    pub fn resync_all(self: &Arc<Self>) -> Vec<DeploymentAction> {
        let mut actions = Vec::new();
        for config_id in self.store.config_ids() {
            let ctx = match self.store.context_for_config(config_id) {
                Ok(ctx) => ctx,
                Err(e) => {
                    debug!(config_id, error = %e, "Skipping config in re-sync");
                    continue;
                }
            };
            if ctx.config.needs_bouncer() {
                // The recorded key publishes a config change, which syncs
                actions.push(self.schedule_bouncer_provisioning(config_id));
                continue;
            }
            if !ctx.config.is_active() {
                continue;
            }

            actions.push(self.schedule_sync(config_id, true));
            for rule in ctx.rules.iter().filter(|r| r.enabled && r.is_ip_ban()) {
                self.schedule_decisions(config_id, rule.id);
                actions.push(DeploymentAction::DecisionsScheduled { rule_id: rule.id });
            }
        }
        actions
    }

    fn ban_decisions(&self, ctx: &DeploymentContext, rule: &FirewallRule) -> Vec<Decision> {
        match self.store.compiler().decisions(ctx, rule) {
            Ok(decisions) => decisions,
            Err(e) => {
                debug!(rule_id = rule.id, error = %e, "Rule yields no decisions");
                Vec::new()
            }
        }
    }

    fn schedule_bouncer_provisioning(self: &Arc<Self>, config_id: u64) -> DeploymentAction {
        self.scheduler.dispatch(
            Arc::new(ProvisionBouncerJob {
                service: self.clone(),
                config_id,
            }),
            JobOptions::on(Queue::Security).retry(self.settings.sync_retry()),
        );
        DeploymentAction::BouncerProvisionScheduled { config_id }
    }

    fn schedule_decisions(self: &Arc<Self>, config_id: u64, rule_id: u64) {
        self.scheduler.dispatch(
            Arc::new(ApplyDecisionsJob {
                service: self.clone(),
                config_id,
                rule_id,
            }),
            JobOptions::on(Queue::Security)
                .delay(self.settings.decision_delay())
                .retry(self.settings.sync_retry()),
        );
    }

    fn schedule_decision_removal(
        self: &Arc<Self>,
        ctx: &DeploymentContext,
        rule_id: u64,
        decisions: Vec<Decision>,
    ) -> Option<DeploymentAction> {
        if decisions.is_empty() {
            return None;
        }
        let count = decisions.len();
        self.scheduler.dispatch(
            Arc::new(RemoveDecisionsJob {
                service: self.clone(),
                server_id: ctx.server.id,
                decisions,
            }),
            JobOptions::on(Queue::Security)
                .delay(self.settings.decision_delay())
                .retry(self.settings.sync_retry()),
        );
        Some(DeploymentAction::DecisionRemovalScheduled {
            rule_id,
            decisions: count,
        })
    }

    fn schedule_sync(self: &Arc<Self>, config_id: u64, redeploy: bool) -> DeploymentAction {
        let generation = {
            let mut state = self.syncs.entry(config_id).or_default();
            state.generation += 1;
            state.redeploy_pending |= redeploy;
            state.generation
        };
        self.scheduler.dispatch(
            Arc::new(SyncScenariosJob {
                service: self.clone(),
                config_id,
                generation,
            }),
            JobOptions::on(Queue::Security).retry(self.settings.sync_retry()),
        );
        DeploymentAction::SyncScheduled {
            config_id,
            generation,
            redeploy,
        }
    }

    fn schedule_bouncer_reload(&self, server_id: ServerId) {
        self.scheduler.dispatch(
            Arc::new(BouncerReloadJob {
                engine: self.engine.clone(),
                store: self.store.clone(),
                server_id,
            }),
            JobOptions::on(Queue::Security)
                .delay(self.settings.bouncer_reload_delay())
                .retry(RetryPolicy::from_seconds(2, &[10], None)),
        );
    }

    fn is_superseded(&self, config_id: u64, generation: u64) -> bool {
        self.syncs
            .get(&config_id)
            .map(|state| state.generation > generation)
            .unwrap_or(false)
    }

    fn take_redeploy(&self, config_id: u64) -> bool {
        self.syncs
            .get_mut(&config_id)
            .map(|mut state| std::mem::take(&mut state.redeploy_pending))
            .unwrap_or(false)
    }

    fn active_context(&self, config_id: u64) -> Result<DeploymentContext> {
        let ctx = self.store.context_for_config(config_id)?;
        if !ctx.config.is_active() {
            return Err(SecurityError::Configuration(format!(
                "firewall for {} is inactive",
                ctx.app_uuid()
            )));
        }
        Ok(ctx)
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Replace an application's scenario set with the full compiled rule set
pub struct SyncScenariosJob {
    service: Arc<DeploymentService>,
    config_id: u64,
    generation: u64,
}

#[async_trait]
impl Job for SyncScenariosJob {
    fn name(&self) -> String {
        format!("sync-scenarios-config-{}-gen-{}", self.config_id, self.generation)
    }

    async fn handle(&self, _attempt: u32) -> Result<()> {
        let service = &self.service;
        if service.is_superseded(self.config_id, self.generation) {
            info!(config_id = self.config_id, generation = self.generation, "Sync superseded by a newer one");
            return Ok(());
        }

        let ctx = service.active_context(self.config_id)?;
        let compiler = service.store.compiler();
        let files = compiler
            .compile_rule_set(&ctx)?
            .iter()
            .map(|scenario| compiler.render(scenario))
            .collect::<std::result::Result<Vec<ScenarioFile>, _>>()?;

        let still_current = || !service.is_superseded(self.config_id, self.generation);
        let written = service
            .scenarios
            .replace_all(&ctx.server, ctx.app_uuid(), &files, &still_current)
            .await?;
        if !written {
            info!(config_id = self.config_id, generation = self.generation, "Sync superseded while waiting for upload");
            return Ok(());
        }
        service.engine.reload(&ctx.server).await?;
        info!(
            app_uuid = %ctx.app_uuid(),
            server_id = ctx.server.id,
            scenarios = files.len(),
            "Scenario set deployed"
        );

        if service.take_redeploy(self.config_id) {
            let correlation_id = Uuid::new_v4();
            if let Err(e) = service
                .trigger
                .enqueue_deployment(ctx.application.id, correlation_id, false)
                .await
            {
                warn!(
                    application_id = ctx.application.id,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to trigger application redeploy"
                );
            }
        }

        service.schedule_bouncer_reload(ctx.server.id);
        Ok(())
    }
}

/// Push the decisions of one ip_ban rule, skipping those already present
pub struct ApplyDecisionsJob {
    service: Arc<DeploymentService>,
    config_id: u64,
    rule_id: u64,
}

#[async_trait]
impl Job for ApplyDecisionsJob {
    fn name(&self) -> String {
        format!("apply-decisions-rule-{}", self.rule_id)
    }

    async fn handle(&self, _attempt: u32) -> Result<()> {
        let service = &self.service;
        let ctx = service.active_context(self.config_id)?;
        let rule = match ctx.rule(self.rule_id) {
            Some(rule) if rule.enabled && rule.is_ip_ban() => rule,
            _ => {
                debug!(rule_id = self.rule_id, "Rule gone or no longer an active ban");
                return Ok(());
            }
        };

        let decisions = service.store.compiler().decisions(&ctx, rule)?;
        let mut created = 0usize;
        for decision in &decisions {
            if decision_exists(service.engine.as_ref(), &ctx, decision).await? {
                debug!(ip = %decision.ip, "Decision already present");
                continue;
            }
            service.engine.create_decision(&ctx.server, decision).await?;
            counter!("bastion_decisions_created_total", 1);
            created += 1;
        }

        info!(
            rule_id = self.rule_id,
            created,
            skipped = decisions.len() - created,
            "Ban decisions applied"
        );
        service.schedule_bouncer_reload(ctx.server.id);
        Ok(())
    }
}

async fn decision_exists(
    engine: &dyn EngineApi,
    ctx: &DeploymentContext,
    decision: &Decision,
) -> Result<bool> {
    let existing = engine.list_decisions(&ctx.server, &decision.ip).await?;
    Ok(existing
        .iter()
        .any(|e| e.value == decision.ip && e.scenario == decision.reason))
}

/// Remove decisions previously created for a rule
pub struct RemoveDecisionsJob {
    service: Arc<DeploymentService>,
    server_id: ServerId,
    decisions: Vec<Decision>,
}

#[async_trait]
impl Job for RemoveDecisionsJob {
    fn name(&self) -> String {
        format!("remove-decisions-server-{}", self.server_id)
    }

    async fn handle(&self, _attempt: u32) -> Result<()> {
        let service = &self.service;
        let server = service.store.servers().get(self.server_id)?;
        let mut removed = 0usize;
        for decision in &self.decisions {
            for existing in service.engine.list_decisions(&server, &decision.ip).await? {
                if existing.scenario == decision.reason {
                    service.engine.delete_decision(&server, existing.id).await?;
                    removed += 1;
                }
            }
        }
        info!(server_id = self.server_id, removed, "Ban decisions removed");
        Ok(())
    }
}

/// Register the application's bouncer on the engine and store its key
pub struct ProvisionBouncerJob {
    service: Arc<DeploymentService>,
    config_id: u64,
}

#[async_trait]
impl Job for ProvisionBouncerJob {
    fn name(&self) -> String {
        format!("provision-bouncer-config-{}", self.config_id)
    }

    async fn handle(&self, _attempt: u32) -> Result<()> {
        let service = &self.service;
        let ctx = service.store.context_for_config(self.config_id)?;
        if !ctx.config.needs_bouncer() {
            debug!(config_id = self.config_id, "Bouncer already registered or firewall disabled");
            return Ok(());
        }

        let name = bouncer_name(ctx.app_uuid());
        let current_key = ctx.config.api_key.trim();
        let requested = if current_key.is_empty() {
            None
        } else {
            Some(current_key)
        };
        let api_key = service
            .engine
            .register_bouncer(&ctx.server, &name, requested)
            .await?;

        service.store.record_bouncer(self.config_id, &name, api_key).await?;
        counter!("bastion_bouncers_provisioned_total", 1);
        info!(
            app_uuid = %ctx.app_uuid(),
            server_id = ctx.server.id,
            bouncer = %name,
            "Bouncer provisioned"
        );
        Ok(())
    }
}

/// Force the proxy bouncer to refresh its decision cache
pub struct BouncerReloadJob {
    engine: Arc<dyn EngineApi>,
    store: Arc<FirewallStore>,
    server_id: ServerId,
}

#[async_trait]
impl Job for BouncerReloadJob {
    fn name(&self) -> String {
        format!("bouncer-reload-server-{}", self.server_id)
    }

    async fn handle(&self, _attempt: u32) -> Result<()> {
        let server = self.store.servers().get(self.server_id)?;
        self.engine.reload_bouncer_cache(&server).await
    }
}
