//! Engine administrative API
//!
//! Decisions, scenario listing and reloads are driven through `cscli`
//! inside the engine container on the managed server.

use async_trait::async_trait;
use bastion_common::{Decision, DecisionScope, Server};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::config::EngineConfig;
use crate::error::{Result, SecurityError};
use crate::remote::{shell_quote, RemoteExecutor};

/// Decision as reported back by the engine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineDecision {
    pub id: u64,
    #[serde(default)]
    pub origin: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub scope: String,
    pub value: String,
    #[serde(default)]
    pub duration: String,
    /// Carries the reason given at creation time
    #[serde(default)]
    pub scenario: String,
}

/// Alert raised by the engine, as listed by `cscli alerts list -o json`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineAlert {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub source: Option<AlertSource>,
    #[serde(default)]
    pub decisions: Option<Vec<EngineDecision>>,
    #[serde(default)]
    pub events_count: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta: Option<Vec<AlertMeta>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AlertSource {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AlertMeta {
    pub key: String,
    pub value: String,
}

impl EngineAlert {
    pub fn source_ip(&self) -> Option<&str> {
        let source = self.source.as_ref()?;
        source
            .ip
            .as_deref()
            .or(source.value.as_deref())
            .filter(|ip| !ip.is_empty())
    }

    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|m| m.key == key)
            .map(|m| m.value.as_str())
    }

    pub fn decisions(&self) -> &[EngineDecision] {
        self.decisions.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ScenarioListing {
    #[serde(default)]
    scenarios: Vec<ScenarioEntry>,
}

#[derive(Debug, Deserialize)]
struct ScenarioEntry {
    name: String,
}

#[async_trait]
pub trait EngineApi: Send + Sync + 'static {
    async fn create_decision(&self, server: &Server, decision: &Decision) -> Result<()>;

    /// Active decisions targeting `ip`
    async fn list_decisions(&self, server: &Server, ip: &str) -> Result<Vec<EngineDecision>>;

    async fn delete_decision(&self, server: &Server, decision_id: u64) -> Result<()>;

    /// Names of every scenario loaded by the engine
    async fn list_scenarios(&self, server: &Server) -> Result<Vec<String>>;

    /// Alerts raised within the last `since_hours`
    async fn list_alerts(&self, server: &Server, since_hours: u64) -> Result<Vec<EngineAlert>>;

    /// (Re)create bouncer `name` and return its api key. With `api_key`
    /// the engine registers that key, otherwise it issues a new one.
    async fn register_bouncer(&self, server: &Server, name: &str, api_key: Option<&str>) -> Result<String>;

    /// Make the engine pick up changed scenario files
    async fn reload(&self, server: &Server) -> Result<()>;

    /// Force the proxy bouncer to drop its cached decisions
    async fn reload_bouncer_cache(&self, server: &Server) -> Result<()>;
}

pub struct CscliEngine<E: RemoteExecutor> {
    executor: Arc<E>,
    config: EngineConfig,
}

impl<E: RemoteExecutor> CscliEngine<E> {
    pub fn new(executor: Arc<E>, config: EngineConfig) -> Self {
        Self { executor, config }
    }

    fn cscli(&self, args: &[&str]) -> String {
        let mut command = format!("docker exec {} cscli", shell_quote(&self.config.container_name));
        for arg in args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        command
    }

    /// Marker file in the proxy's watched directory; rewriting it makes the
    /// proxy rebuild its middlewares and with them the bouncer cache
    pub fn reload_marker_path(&self) -> String {
        format!("{}/crowdsec-reload.yaml", self.config.proxy_dynamic_dir)
    }
}

/// `cscli ... -o json` prints `null` when there is nothing to list
fn parse_alerts(output: &str) -> Result<Vec<EngineAlert>> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let alerts: Option<Vec<EngineAlert>> = serde_json::from_str(trimmed)?;
    Ok(alerts.unwrap_or_default())
}

/// Decision listings are alerts with their decisions attached
fn parse_decisions(output: &str) -> Result<Vec<EngineDecision>> {
    Ok(parse_alerts(output)?
        .into_iter()
        .flat_map(|alert| alert.decisions.unwrap_or_default())
        .collect())
}

fn parse_scenarios(output: &str) -> Result<Vec<String>> {
    let listing: ScenarioListing = serde_json::from_str(output.trim())?;
    Ok(listing.scenarios.into_iter().map(|s| s.name).collect())
}

#[async_trait]
impl<E: RemoteExecutor> EngineApi for CscliEngine<E> {
    #[instrument(skip(self, server), fields(server_id = server.id))]
    async fn create_decision(&self, server: &Server, decision: &Decision) -> Result<()> {
        let target_flag = match decision.scope {
            DecisionScope::Ip => "--ip",
            DecisionScope::Range => "--range",
        };
        let duration = decision.duration_literal();
        let command = self.cscli(&[
            "decisions",
            "add",
            target_flag,
            &decision.ip,
            "--duration",
            &duration,
            "--type",
            decision.kind.as_str(),
            "--reason",
            &decision.reason,
        ]);
        self.executor.exec(server, &[command]).await?;
        info!(ip = %decision.ip, reason = %decision.reason, "Decision created");
        Ok(())
    }

    async fn list_decisions(&self, server: &Server, ip: &str) -> Result<Vec<EngineDecision>> {
        let flag = if ip.contains('/') { "--range" } else { "--ip" };
        let command = self.cscli(&["decisions", "list", flag, ip, "-o", "json"]);
        let output = self.executor.exec(server, &[command]).await?;
        parse_decisions(&output)
    }

    async fn delete_decision(&self, server: &Server, decision_id: u64) -> Result<()> {
        let id = decision_id.to_string();
        let command = self.cscli(&["decisions", "delete", "--id", &id]);
        self.executor.exec(server, &[command]).await?;
        debug!(decision_id, "Decision deleted");
        Ok(())
    }

    async fn list_scenarios(&self, server: &Server) -> Result<Vec<String>> {
        let command = self.cscli(&["scenarios", "list", "-o", "json"]);
        let output = self.executor.exec(server, &[command]).await?;
        parse_scenarios(&output)
    }

    async fn list_alerts(&self, server: &Server, since_hours: u64) -> Result<Vec<EngineAlert>> {
        let since = format!("{}h", since_hours);
        let command = self.cscli(&["alerts", "list", "--since", &since, "--limit", "100", "-o", "json"]);
        let output = self.executor.exec(server, &[command]).await?;
        parse_alerts(&output)
    }

    #[instrument(skip(self, server, api_key), fields(server_id = server.id))]
    async fn register_bouncer(&self, server: &Server, name: &str, api_key: Option<&str>) -> Result<String> {
        let delete = format!("{} >/dev/null 2>&1 || true", self.cscli(&["bouncers", "delete", name]));
        let mut args = vec!["bouncers", "add", name];
        if let Some(key) = api_key {
            args.extend(["--key", key]);
        }
        args.extend(["-o", "raw"]);
        let output = self.executor.exec(server, &[delete, self.cscli(&args)]).await?;

        let issued = output.lines().map(str::trim).rfind(|line| !line.is_empty());
        match issued {
            Some(key) => {
                info!(bouncer = name, "Bouncer registered");
                Ok(key.to_string())
            }
            None => Err(SecurityError::Transport(format!(
                "engine returned no key for bouncer {}",
                name
            ))),
        }
    }

    #[instrument(skip(self, server), fields(server_id = server.id))]
    async fn reload(&self, server: &Server) -> Result<()> {
        let command = format!(
            "docker kill --signal=SIGHUP {}",
            shell_quote(&self.config.container_name)
        );
        self.executor.exec(server, &[command]).await?;
        info!("Engine reloaded");
        Ok(())
    }

    #[instrument(skip(self, server), fields(server_id = server.id))]
    async fn reload_bouncer_cache(&self, server: &Server) -> Result<()> {
        let marker = format!(
            "# bouncer cache generation {}\nhttp: {{}}\n",
            Utc::now().to_rfc3339()
        );
        self.executor
            .upload(server, marker.as_bytes(), &self.reload_marker_path())
            .await?;
        info!("Bouncer cache reload requested");
        Ok(())
    }
}
