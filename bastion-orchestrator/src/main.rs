use anyhow::{Context, Result};
use bastion_orchestrator::{
    alerts::{AlertStore, AlertSync},
    api::{create_api_router, AppState},
    bootstrap::{InstallerSet, SecurityBootstrapper},
    compiler::RuleCompiler,
    config::{OrchestratorSettings, DEFAULT_CONFIG_PATH},
    deployment::DeploymentService,
    engine::{CscliEngine, EngineApi},
    events::{bridge_nats, EventBus, RuleEvent, ServerEvent},
    hooks::{
        DeploymentTrigger, FailureHook, LogOnlyDeploymentTrigger, LogOnlyFailureHook,
        WebhookDeploymentTrigger, WebhookFailureHook,
    },
    labels::LabelGenerator,
    metrics::{describe_metrics, TrafficMetricsCollector},
    registry::ServerRegistry,
    remote::SshExecutor,
    scenario_store::{RemoteScenarioStore, ScenarioStore},
    scheduler::JobScheduler,
    store::FirewallStore,
};
use chrono::Utc;
use metrics::gauge;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("BASTION_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let settings = match OrchestratorSettings::from_file(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load config {}: {}, using defaults", config_path, e);
            OrchestratorSettings::default()
        }
    };

    init_tracing(&settings);

    info!(
        config = %config_path,
        "Starting Bastion Orchestrator v{}",
        env!("CARGO_PKG_VERSION")
    );

    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    // Server registry, restored from the last snapshot when configured
    let registry = match &settings.server.state_file {
        Some(path) => Arc::new(
            ServerRegistry::load_snapshot(&PathBuf::from(path))
                .with_context(|| format!("Failed to restore server registry from {}", path))?,
        ),
        None => Arc::new(ServerRegistry::new()),
    };

    let rule_events: Arc<EventBus<RuleEvent>> = Arc::new(EventBus::new());
    let server_events: Arc<EventBus<ServerEvent>> = Arc::new(EventBus::new());
    let scheduler = JobScheduler::start(settings.scheduler.workers);

    let store = Arc::new(FirewallStore::new(
        RuleCompiler::new(settings.scenarios.clone()),
        registry.clone(),
        rule_events.clone(),
    ));

    // Remote transports
    let executor = Arc::new(SshExecutor::new(settings.ssh.clone()));
    let engine: Arc<dyn EngineApi> = Arc::new(CscliEngine::new(executor.clone(), settings.engine.clone()));
    let scenario_store: Arc<dyn ScenarioStore> = Arc::new(RemoteScenarioStore::new(
        executor.clone(),
        settings.engine.scenario_dir.clone(),
    ));

    let trigger: Arc<dyn DeploymentTrigger> = match &settings.deployment.redeploy_webhook_url {
        Some(url) => Arc::new(WebhookDeploymentTrigger::new(url.clone())),
        None => Arc::new(LogOnlyDeploymentTrigger),
    };
    let failure_hook: Arc<dyn FailureHook> = match &settings.hooks.failure_webhook_url {
        Some(url) => Arc::new(WebhookFailureHook::new(url.clone())),
        None => Arc::new(LogOnlyFailureHook),
    };

    // Rule deployment
    let deployment = DeploymentService::new(
        store.clone(),
        engine.clone(),
        scenario_store,
        trigger,
        scheduler.clone(),
        settings.deployment.clone(),
    );
    deployment.spawn(&rule_events);

    // Server bootstrap
    let installers = InstallerSet::standard(executor, &settings.engine, &settings.bouncer);
    let bootstrapper = SecurityBootstrapper::new(
        registry.clone(),
        installers,
        scheduler.clone(),
        &settings.bootstrap,
        failure_hook,
    );
    bootstrapper.spawn(&server_events);

    // Engine alerts
    let alerts = Arc::new(AlertStore::new(&settings.alerts));
    if settings.alerts.enabled {
        AlertSync::new(
            store.clone(),
            engine.clone(),
            alerts.clone(),
            scheduler.clone(),
            settings.alerts.clone(),
        )
        .spawn();
    }

    if settings.nats.enabled {
        start_nats_bridges(&settings, rule_events.clone(), server_events.clone()).await;
    }

    // Initialize metrics
    describe_metrics();
    let metrics_addr: SocketAddr = settings
        .server
        .metrics_addr
        .parse()
        .with_context(|| format!("Invalid metrics address {}", settings.server.metrics_addr))?;
    let metrics_registry = registry.clone();
    let metrics_scheduler = scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr, metrics_registry, metrics_scheduler).await {
            error!(error = %e, "Failed to start metrics server");
        }
    });

    if let Some(path) = settings.server.state_file.clone() {
        let snapshot_registry = registry.clone();
        let interval = Duration::from_secs(settings.server.snapshot_interval_seconds.max(1));
        tokio::spawn(async move {
            snapshot_loop(snapshot_registry, PathBuf::from(path), interval).await;
        });
    }

    let state = AppState {
        store,
        registry: registry.clone(),
        engine,
        alerts,
        labels: Arc::new(LabelGenerator::new(settings.bouncer.clone(), settings.engine.clone())),
        server_events,
        traffic: Arc::new(TrafficMetricsCollector::new()),
        started_at: Utc::now(),
    };
    let app = create_api_router(state);

    info!(listen_addr = %settings.server.listen_addr, "Starting management API server");
    let listener = tokio::net::TcpListener::bind(&settings.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.server.listen_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!(pending_jobs = scheduler.pending(), "Shutting down, draining job queues");
    scheduler.shutdown();
    if let Some(path) = &settings.server.state_file {
        if let Err(e) = registry.write_snapshot(&PathBuf::from(path)) {
            error!(error = %e, "Failed to write final registry snapshot");
        }
    }

    Ok(())
}

fn init_tracing(settings: &OrchestratorSettings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("bastion_orchestrator={}", settings.logging.level).into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if settings.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn start_nats_bridges(
    settings: &OrchestratorSettings,
    rule_events: Arc<EventBus<RuleEvent>>,
    server_events: Arc<EventBus<ServerEvent>>,
) {
    info!(nats_url = %settings.nats.url, "Connecting to NATS");
    let client = match async_nats::connect(&settings.nats.url).await {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "NATS unavailable, continuing with the in-process bus only");
            return;
        }
    };

    let rule_client = client.clone();
    let rule_subject = settings.nats.rule_events_subject.clone();
    tokio::spawn(async move {
        if let Err(e) = bridge_nats(rule_client, rule_subject, rule_events).await {
            error!(error = %e, "Rule event bridge failed");
        }
    });

    let server_subject = settings.nats.server_events_subject.clone();
    tokio::spawn(async move {
        if let Err(e) = bridge_nats(client, server_subject, server_events).await {
            error!(error = %e, "Server event bridge failed");
        }
    });
}

/// Start Prometheus metrics server
async fn start_metrics_server(
    addr: SocketAddr,
    registry: Arc<ServerRegistry>,
    scheduler: JobScheduler,
) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(metrics_addr = %addr, "Prometheus metrics server started");

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        let servers = registry.list();
        let validated = servers
            .iter()
            .filter(|s| s.status.installation_validated)
            .count();

        gauge!("bastion_servers_total", servers.len() as f64);
        gauge!("bastion_servers_validated", validated as f64);
        gauge!("bastion_jobs_pending", scheduler.pending() as f64);
    }
}

async fn snapshot_loop(registry: Arc<ServerRegistry>, path: PathBuf, every: Duration) {
    let mut interval = time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = registry.write_snapshot(&path) {
            error!(error = %e, path = %path.display(), "Failed to write registry snapshot");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
