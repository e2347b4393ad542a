// Component Installers - idempotent remote install steps and health checks
// for each security component

use async_trait::async_trait;
use bastion_common::{Component, ComponentHealth, Server};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::{BouncerConfig, EngineConfig};
use crate::error::{Result, SecurityError};
use crate::registry::StatusUpdate;
use crate::remote::{parent_dir, shell_quote, RemoteExecutor};

/// Installs and checks one component. `install` must be safe to repeat.
#[async_trait]
pub trait ComponentInstaller: Send + Sync + 'static {
    fn component(&self) -> Component;

    /// Returns extra status updates owned by this component, beyond its
    /// own installed flag
    async fn install(&self, server: &Server) -> Result<Vec<StatusUpdate>>;

    async fn validate(&self, server: &Server) -> ComponentHealth;
}

/// Installers keyed by the component they own
#[derive(Clone, Default)]
pub struct InstallerSet {
    installers: HashMap<Component, Arc<dyn ComponentInstaller>>,
}

impl InstallerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, installer: Arc<dyn ComponentInstaller>) -> Self {
        self.installers.insert(installer.component(), installer);
        self
    }

    pub fn get(&self, component: Component) -> Option<Arc<dyn ComponentInstaller>> {
        self.installers.get(&component).cloned()
    }

    /// One installer per component, all over the same transport
    pub fn standard<E: RemoteExecutor>(
        executor: Arc<E>,
        engine: &EngineConfig,
        bouncer: &BouncerConfig,
    ) -> Self {
        Self::new()
            .with(Arc::new(CrowdSecInstaller::new(executor.clone(), engine.clone(), bouncer.clone())))
            .with(Arc::new(RequestLoggingInstaller::new(executor.clone(), engine.clone())))
            .with(Arc::new(HeaderLoggingInstaller::new(executor.clone(), engine.clone())))
            .with(Arc::new(LogShippingInstaller::new(executor.clone(), engine.clone())))
            .with(Arc::new(TrafficLoggerInstaller::new(executor, engine.clone())))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Bouncer name registered on the engine for the proxy plugin
pub const BOUNCER_NAME: &str = "bastion-proxy";

/// Proxy start-up argument after which access log flags are inserted
const PROXY_FLAG_ANCHOR: &str = "--entrypoints.http.address";

pub const ACCESS_LOG_CONTAINER_PATH: &str = "/traefik/access.log";

pub const HEADER_LOG_FLAGS: [&str; 4] = [
    "--accesslog.fields.headers.names.User-Agent=keep",
    "--accesslog.fields.headers.names.Referer=keep",
    "--accesslog.fields.headers.names.X-Forwarded-For=keep",
    "--accesslog.fields.headers.names.X-Real-Ip=keep",
];

fn request_log_flags() -> [String; 3] {
    [
        "--accesslog=true".to_string(),
        "--accesslog.format=json".to_string(),
        format!("--accesslog.filepath={}", ACCESS_LOG_CONTAINER_PATH),
    ]
}

/// Add a proxy start-up flag to the compose file unless it is already there
pub fn ensure_proxy_flag(compose_path: &str, flag: &str) -> String {
    let sed = format!("/{}/a\\      - {}", PROXY_FLAG_ANCHOR, flag);
    format!(
        "grep -qF -- {flag} {path} || sed -i {sed} {path}",
        flag = shell_quote(flag),
        path = shell_quote(compose_path),
        sed = shell_quote(&sed),
    )
}

fn recreate_proxy(engine: &EngineConfig) -> String {
    format!(
        "cd {} && docker compose up -d --force-recreate",
        shell_quote(parent_dir(&engine.proxy_compose_path))
    )
}

/// Poll `check` until it succeeds, within one attempt
fn wait_for(check: &str, tries: u32, interval_secs: u32) -> String {
    format!(
        "i=0; until {check} >/dev/null 2>&1; do i=$((i+1)); [ $i -ge {tries} ] && exit 1; sleep {interval_secs}; done"
    )
}

fn container_running(executor_output: &str) -> bool {
    executor_output.trim_start().starts_with("Up")
}

fn docker_status(container: &str) -> String {
    format!(
        "docker ps --filter {} --format '{{{{.Status}}}}'",
        shell_quote(&format!("name=^{}$", container))
    )
}

fn health_from(result: Result<String>, check: impl Fn(&str) -> bool, what: &str) -> ComponentHealth {
    match result {
        Ok(output) if check(&output) => ComponentHealth::healthy(format!("{} ok", what)),
        Ok(output) => ComponentHealth::unhealthy(format!("{} check failed: {}", what, output.trim())),
        Err(e) => ComponentHealth::unhealthy(format!("{} unreachable: {}", what, e)),
    }
}

// ============================================================================
// CrowdSec engine
// ============================================================================

pub struct CrowdSecInstaller<E: RemoteExecutor> {
    executor: Arc<E>,
    engine: EngineConfig,
    bouncer: BouncerConfig,
}

impl<E: RemoteExecutor> CrowdSecInstaller<E> {
    pub fn new(executor: Arc<E>, engine: EngineConfig, bouncer: BouncerConfig) -> Self {
        Self {
            executor,
            engine,
            bouncer,
        }
    }

    fn cscli(&self, args: &str) -> String {
        format!("docker exec {} cscli {}", shell_quote(&self.engine.container_name), args)
    }

    pub fn compose_file(&self) -> String {
        let base = &self.engine.base_dir;
        format!(
            r#"services:
  {name}:
    image: {image}
    container_name: {name}
    restart: unless-stopped
    environment:
      COLLECTIONS: "crowdsecurity/traefik crowdsecurity/http-cve crowdsecurity/appsec-virtual-patching crowdsecurity/appsec-generic-rules"
    volumes:
      - {base}/config:/etc/crowdsec
      - {base}/data:/var/lib/crowdsec/data
      - {scenarios}:/etc/crowdsec/scenarios/bastion
      - {proxy}:/traefik:ro
    networks:
      - bastion
networks:
  bastion:
    external: true
"#,
            name = self.engine.container_name,
            image = self.engine.image,
            base = base,
            scenarios = self.engine.scenario_dir,
            proxy = parent_dir(&self.engine.proxy_compose_path),
        )
    }

    /// Dynamic proxy configuration declaring the bouncer plugin
    pub fn proxy_dynamic_config(&self, bouncer_key: &str) -> String {
        format!(
            r#"http:
  middlewares:
    crowdsec:
      plugin:
        bouncer:
          enabled: true
          logLevel: {log_level}
          updateIntervalSeconds: {interval}
          crowdsecMode: {mode}
          crowdsecLapiKey: {key}
          crowdsecLapiHost: {host}
          crowdsecLapiScheme: {scheme}
"#,
            log_level = self.bouncer.log_level,
            interval = self.bouncer.update_interval_seconds,
            mode = self.bouncer.mode,
            key = bouncer_key,
            host = self.engine.lapi_host,
            scheme = self.engine.lapi_scheme,
        )
    }

    async fn register_alert_webhook(&self, server: &Server, url: &str) -> Result<()> {
        let notification = format!(
            "type: http\nname: bastion_webhook\nlog_level: info\nformat: |\n  {{{{.|toJson}}}}\nurl: {}\nmethod: POST\nheaders:\n  Content-Type: application/json\n",
            url
        );
        let path = format!("{}/config/notifications/bastion.yaml", self.engine.base_dir);
        self.executor.upload(server, notification.as_bytes(), &path).await?;
        self.executor
            .exec(server, &[format!("docker restart {}", shell_quote(&self.engine.container_name))])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<E: RemoteExecutor> ComponentInstaller for CrowdSecInstaller<E> {
    fn component(&self) -> Component {
        Component::CrowdSec
    }

    #[instrument(skip(self, server), fields(server_id = server.id))]
    async fn install(&self, server: &Server) -> Result<Vec<StatusUpdate>> {
        let base = &self.engine.base_dir;
        self.executor
            .exec(
                server,
                &[format!(
                    "mkdir -p {} {} {} {}",
                    shell_quote(&format!("{}/config", base)),
                    shell_quote(&format!("{}/data", base)),
                    shell_quote(&self.engine.scenario_dir),
                    shell_quote(&self.engine.proxy_dynamic_dir),
                )],
            )
            .await?;

        let compose_path = format!("{}/docker-compose.yml", base);
        self.executor
            .upload(server, self.compose_file().as_bytes(), &compose_path)
            .await?;
        self.executor
            .exec(
                server,
                &[
                    "docker network create bastion >/dev/null 2>&1 || true".to_string(),
                    format!("cd {} && docker compose up -d", shell_quote(base)),
                    wait_for(&self.cscli("lapi status"), 30, 2),
                ],
            )
            .await?;

        let bouncer_key = self
            .executor
            .exec(
                server,
                &[
                    format!("{} >/dev/null 2>&1 || true", self.cscli(&format!("bouncers delete {}", BOUNCER_NAME))),
                    self.cscli(&format!("bouncers add {} -o raw", BOUNCER_NAME)),
                ],
            )
            .await?
            .trim()
            .to_string();
        if bouncer_key.is_empty() {
            return Err(SecurityError::Transport(
                "engine returned an empty bouncer key".to_string(),
            ));
        }

        let dynamic_path = format!("{}/crowdsec.yaml", self.engine.proxy_dynamic_dir);
        self.executor
            .upload(server, self.proxy_dynamic_config(&bouncer_key).as_bytes(), &dynamic_path)
            .await?;

        if let Some(url) = &self.engine.alert_webhook_url {
            if let Err(e) = self.register_alert_webhook(server, url).await {
                warn!(error = %e, "Alert webhook registration failed, continuing");
            }
        }

        let appsec_available = match self
            .executor
            .exec(server, &[self.cscli("appsec-configs list -o raw")])
            .await
        {
            Ok(output) => output.contains("appsec-default"),
            Err(e) => {
                debug!(error = %e, "AppSec configs not listable");
                false
            }
        };

        info!(appsec_available, "CrowdSec installed");
        Ok(vec![StatusUpdate::AppSecAvailable(appsec_available)])
    }

    async fn validate(&self, server: &Server) -> ComponentHealth {
        let result = self
            .executor
            .exec(server, &[docker_status(&self.engine.container_name)])
            .await;
        health_from(result, container_running, "crowdsec container")
    }
}

// ============================================================================
// Proxy request logging
// ============================================================================

pub struct RequestLoggingInstaller<E: RemoteExecutor> {
    executor: Arc<E>,
    engine: EngineConfig,
}

impl<E: RemoteExecutor> RequestLoggingInstaller<E> {
    pub fn new(executor: Arc<E>, engine: EngineConfig) -> Self {
        Self { executor, engine }
    }

    fn access_log_host_path(&self) -> String {
        format!("{}/access.log", parent_dir(&self.engine.proxy_compose_path))
    }
}

#[async_trait]
impl<E: RemoteExecutor> ComponentInstaller for RequestLoggingInstaller<E> {
    fn component(&self) -> Component {
        Component::RequestLogging
    }

    #[instrument(skip(self, server), fields(server_id = server.id))]
    async fn install(&self, server: &Server) -> Result<Vec<StatusUpdate>> {
        let mut commands: Vec<String> = request_log_flags()
            .iter()
            .map(|flag| ensure_proxy_flag(&self.engine.proxy_compose_path, flag))
            .collect();
        commands.push(recreate_proxy(&self.engine));
        self.executor.exec(server, &commands).await?;
        info!("Proxy request logging enabled");
        Ok(Vec::new())
    }

    async fn validate(&self, server: &Server) -> ComponentHealth {
        let path = shell_quote(&self.access_log_host_path());
        // An empty log only means no traffic yet
        let check = format!(
            "test -f {path} && {{ [ ! -s {path} ] || tail -n 1 {path} | jq -e . >/dev/null; }} && echo ok"
        );
        let result = self.executor.exec(server, &[check]).await;
        health_from(result, |out| out.trim() == "ok", "access log")
    }
}

// ============================================================================
// Header logging
// ============================================================================

pub struct HeaderLoggingInstaller<E: RemoteExecutor> {
    executor: Arc<E>,
    engine: EngineConfig,
}

impl<E: RemoteExecutor> HeaderLoggingInstaller<E> {
    pub fn new(executor: Arc<E>, engine: EngineConfig) -> Self {
        Self { executor, engine }
    }
}

#[async_trait]
impl<E: RemoteExecutor> ComponentInstaller for HeaderLoggingInstaller<E> {
    fn component(&self) -> Component {
        Component::HeaderLogging
    }

    #[instrument(skip(self, server), fields(server_id = server.id))]
    async fn install(&self, server: &Server) -> Result<Vec<StatusUpdate>> {
        let mut commands: Vec<String> = HEADER_LOG_FLAGS
            .iter()
            .map(|flag| ensure_proxy_flag(&self.engine.proxy_compose_path, flag))
            .collect();
        commands.push(recreate_proxy(&self.engine));
        self.executor.exec(server, &commands).await?;
        info!("Proxy header logging enabled");
        Ok(Vec::new())
    }

    async fn validate(&self, server: &Server) -> ComponentHealth {
        let path = shell_quote(&self.engine.proxy_compose_path);
        let mut checks: Vec<String> = HEADER_LOG_FLAGS
            .iter()
            .map(|flag| format!("grep -qF -- {} {}", shell_quote(flag), path))
            .collect();
        checks.push("echo ok".to_string());
        let result = self.executor.exec(server, &checks).await;
        health_from(result, |out| out.trim() == "ok", "header logging flags")
    }
}

// ============================================================================
// Log shipping into the engine
// ============================================================================

pub struct LogShippingInstaller<E: RemoteExecutor> {
    executor: Arc<E>,
    engine: EngineConfig,
}

impl<E: RemoteExecutor> LogShippingInstaller<E> {
    pub fn new(executor: Arc<E>, engine: EngineConfig) -> Self {
        Self { executor, engine }
    }

    fn acquis_path(&self) -> String {
        format!("{}/config/acquis.yaml", self.engine.base_dir)
    }

    pub fn acquisition(&self) -> String {
        let listen = self
            .engine
            .appsec_host
            .rsplit(':')
            .next()
            .unwrap_or("7422");
        format!(
            "filenames:\n  - {}\nlabels:\n  type: traefik\n---\nsource: appsec\nlisten_addr: 0.0.0.0:{}\nappsec_config: crowdsecurity/appsec-default\nlabels:\n  type: appsec\n",
            ACCESS_LOG_CONTAINER_PATH, listen
        )
    }
}

#[async_trait]
impl<E: RemoteExecutor> ComponentInstaller for LogShippingInstaller<E> {
    fn component(&self) -> Component {
        Component::LogShipping
    }

    #[instrument(skip(self, server), fields(server_id = server.id))]
    async fn install(&self, server: &Server) -> Result<Vec<StatusUpdate>> {
        self.executor
            .upload(server, self.acquisition().as_bytes(), &self.acquis_path())
            .await?;
        self.executor
            .exec(server, &[format!("docker restart {}", shell_quote(&self.engine.container_name))])
            .await?;
        info!("Access log shipping configured");
        Ok(Vec::new())
    }

    async fn validate(&self, server: &Server) -> ComponentHealth {
        let check = format!(
            "grep -qF {} {} && echo ok",
            shell_quote(ACCESS_LOG_CONTAINER_PATH),
            shell_quote(&self.acquis_path())
        );
        let result = self.executor.exec(server, &[check]).await;
        health_from(result, |out| out.trim() == "ok", "acquisition config")
    }
}

// ============================================================================
// Traffic metrics logger
// ============================================================================

pub struct TrafficLoggerInstaller<E: RemoteExecutor> {
    executor: Arc<E>,
    engine: EngineConfig,
}

impl<E: RemoteExecutor> TrafficLoggerInstaller<E> {
    pub fn new(executor: Arc<E>, engine: EngineConfig) -> Self {
        Self { executor, engine }
    }

    pub fn compose_file(&self) -> String {
        format!(
            r#"services:
  traffic-logger:
    image: {image}
    container_name: traffic-logger
    restart: unless-stopped
    ports:
      - "127.0.0.1:3001:3001"
    volumes:
      - {proxy}:/traefik:ro
    environment:
      ACCESS_LOG: {log}
"#,
            image = self.engine.traffic_logger_image,
            proxy = parent_dir(&self.engine.proxy_compose_path),
            log = ACCESS_LOG_CONTAINER_PATH,
        )
    }

    fn health_check(&self) -> String {
        format!("curl -fsS {}", shell_quote(&self.engine.traffic_logger_health_url))
    }
}

#[async_trait]
impl<E: RemoteExecutor> ComponentInstaller for TrafficLoggerInstaller<E> {
    fn component(&self) -> Component {
        Component::TrafficLogger
    }

    #[instrument(skip(self, server), fields(server_id = server.id))]
    async fn install(&self, server: &Server) -> Result<Vec<StatusUpdate>> {
        let dir = &self.engine.traffic_logger_dir;
        self.executor
            .upload(server, self.compose_file().as_bytes(), &format!("{}/docker-compose.yml", dir))
            .await?;
        self.executor
            .exec(
                server,
                &[
                    format!("cd {} && docker compose up -d", shell_quote(dir)),
                    wait_for(&self.health_check(), 10, 2),
                ],
            )
            .await?;
        info!("Traffic logger installed");
        Ok(Vec::new())
    }

    async fn validate(&self, server: &Server) -> ComponentHealth {
        let result = self.executor.exec(server, &[self.health_check()]).await;
        health_from(result, |_| true, "traffic logger health endpoint")
    }
}
