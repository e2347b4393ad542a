//! Orchestrator configuration
//!
//! Loaded from an optional TOML file and overlaid with `BASTION__*`
//! environment variables. Every section has defaults so the orchestrator
//! starts without any file.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::scheduler::RetryPolicy;

/// Configuration file stem loaded when `BASTION_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/default";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub server: ServerConfig,
    pub nats: NatsConfig,
    pub engine: EngineConfig,
    pub bouncer: BouncerConfig,
    pub scenarios: ScenarioConfig,
    pub deployment: DeploymentConfig,
    pub bootstrap: BootstrapConfig,
    pub scheduler: SchedulerConfig,
    pub hooks: HooksConfig,
    pub alerts: AlertsConfig,
    pub ssh: SshConfig,
    pub logging: LoggingConfig,
}

/// Listen addresses and persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub metrics_addr: String,
    /// JSON snapshot of server status flags
    pub state_file: Option<String>,
    pub snapshot_interval_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3030".to_string(),
            metrics_addr: "0.0.0.0:9091".to_string(),
            state_file: None,
            snapshot_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub enabled: bool,
    pub url: String,
    pub rule_events_subject: String,
    pub server_events_subject: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "nats://127.0.0.1:4222".to_string(),
            rule_events_subject: "bastion.events.rules".to_string(),
            server_events_subject: "bastion.events.servers".to_string(),
        }
    }
}

/// Where the security engine and the proxy live on a managed server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub image: String,
    pub container_name: String,
    pub lapi_host: String,
    pub lapi_scheme: String,
    pub appsec_host: String,
    /// Host directory holding the engine configuration
    pub base_dir: String,
    /// Host directory mounted as the engine's scenario directory
    pub scenario_dir: String,
    pub proxy_container: String,
    pub proxy_compose_path: String,
    pub proxy_dynamic_dir: String,
    pub traffic_logger_image: String,
    pub traffic_logger_dir: String,
    pub traffic_logger_health_url: String,
    /// Alert notification endpoint registered on the engine
    pub alert_webhook_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            image: "crowdsecurity/crowdsec:latest".to_string(),
            container_name: "crowdsec".to_string(),
            lapi_host: "crowdsec:8080".to_string(),
            lapi_scheme: "http".to_string(),
            appsec_host: "crowdsec:7422".to_string(),
            base_dir: "/data/bastion/crowdsec".to_string(),
            scenario_dir: "/data/bastion/crowdsec/config/scenarios".to_string(),
            proxy_container: "bastion-proxy".to_string(),
            proxy_compose_path: "/data/bastion/proxy/docker-compose.yml".to_string(),
            proxy_dynamic_dir: "/data/bastion/proxy/dynamic".to_string(),
            traffic_logger_image: "ghcr.io/bastion-sh/traffic-logger:latest".to_string(),
            traffic_logger_dir: "/opt/traffic-logger".to_string(),
            traffic_logger_health_url: "http://localhost:3001/health".to_string(),
            alert_webhook_url: None,
        }
    }
}

/// Settings rendered into the proxy bouncer middleware labels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BouncerConfig {
    pub middleware_namespace: String,
    pub appsec_namespace: String,
    pub mode: String,
    pub update_interval_seconds: u64,
    pub log_level: String,
    pub trusted_proxies: Vec<String>,
    pub local_cache: bool,
    /// Global switch for payload inspection
    pub appsec_feature_enabled: bool,
    pub http_timeout_seconds: u64,
    pub blocked_status_code: u16,
}

impl Default for BouncerConfig {
    fn default() -> Self {
        Self {
            middleware_namespace: "crowdsec".to_string(),
            appsec_namespace: "appsec".to_string(),
            mode: "live".to_string(),
            update_interval_seconds: 10,
            log_level: "INFO".to_string(),
            trusted_proxies: vec![
                "10.0.0.0/8".to_string(),
                "172.16.0.0/12".to_string(),
                "192.168.0.0/16".to_string(),
            ],
            local_cache: true,
            appsec_feature_enabled: true,
            http_timeout_seconds: 10,
            blocked_status_code: 403,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// First segment of every compiled scenario name
    pub namespace: String,
    pub capacity: u32,
    pub leakspeed: String,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            namespace: "bastion".to_string(),
            capacity: 1,
            leakspeed: "10s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub decision_delay_seconds: u64,
    pub bouncer_reload_delay_seconds: u64,
    /// Endpoint that queues an application redeploy
    pub redeploy_webhook_url: Option<String>,
    pub sync_tries: u32,
    pub sync_backoff_seconds: Vec<u64>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            decision_delay_seconds: 2,
            bouncer_reload_delay_seconds: 2,
            redeploy_webhook_url: None,
            sync_tries: 3,
            sync_backoff_seconds: vec![10, 30, 60],
        }
    }
}

impl DeploymentConfig {
    pub fn decision_delay(&self) -> Duration {
        Duration::from_secs(self.decision_delay_seconds)
    }

    pub fn bouncer_reload_delay(&self) -> Duration {
        Duration::from_secs(self.bouncer_reload_delay_seconds)
    }

    pub fn sync_retry(&self) -> RetryPolicy {
        RetryPolicy::from_seconds(self.sync_tries, &self.sync_backoff_seconds, None)
    }
}

/// Staggered install schedule, offsets relative to server creation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub crowdsec_offset_seconds: u64,
    pub crowdsec_tries: u32,
    pub crowdsec_backoff_seconds: Vec<u64>,
    /// Measured from the first attempt
    pub crowdsec_retry_window_seconds: u64,
    pub request_logging_offset_seconds: u64,
    pub header_logging_offset_seconds: u64,
    pub log_shipping_offset_seconds: u64,
    pub traffic_logger_offset_seconds: u64,
    pub validation_offset_seconds: u64,
    pub revalidate_after_seconds: u64,
    pub max_revalidations: u32,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            crowdsec_offset_seconds: 120,
            crowdsec_tries: 3,
            crowdsec_backoff_seconds: vec![60, 300, 900],
            crowdsec_retry_window_seconds: 3600,
            request_logging_offset_seconds: 150,
            header_logging_offset_seconds: 165,
            log_shipping_offset_seconds: 180,
            traffic_logger_offset_seconds: 240,
            validation_offset_seconds: 480,
            revalidate_after_seconds: 600,
            max_revalidations: 3,
        }
    }
}

impl BootstrapConfig {
    pub fn crowdsec_retry(&self) -> RetryPolicy {
        RetryPolicy::from_seconds(
            self.crowdsec_tries,
            &self.crowdsec_backoff_seconds,
            Some(self.crowdsec_retry_window_seconds),
        )
    }

    pub fn revalidate_after(&self) -> Duration {
        Duration::from_secs(self.revalidate_after_seconds)
    }

    fn ordered_offsets(&self) -> [u64; 6] {
        [
            self.crowdsec_offset_seconds,
            self.request_logging_offset_seconds,
            self.header_logging_offset_seconds,
            self.log_shipping_offset_seconds,
            self.traffic_logger_offset_seconds,
            self.validation_offset_seconds,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Receives a JSON payload when an install permanently fails
    pub failure_webhook_url: Option<String>,
}

/// Periodic pull of engine alerts into per-application alert feeds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub sync_interval_seconds: u64,
    /// How far back each pull asks the engine to look
    pub lookback_hours: u64,
    /// Same ip and scenario for one application within this window is one alert
    pub dedupe_window_seconds: u64,
    pub max_per_application: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval_seconds: 300,
            lookback_hours: 24,
            dedupe_window_seconds: 3600,
            max_per_application: 500,
        }
    }
}

impl AlertsConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    pub fn dedupe_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedupe_window_seconds as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub identity_file: Option<String>,
    pub connect_timeout_seconds: u64,
    pub command_timeout_seconds: u64,
    pub strict_host_key_checking: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            identity_file: None,
            connect_timeout_seconds: 10,
            command_timeout_seconds: 300,
            strict_host_key_checking: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl OrchestratorSettings {
    /// Load configuration from file and environment
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("BASTION").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.workers == 0 {
            return Err("Scheduler needs at least one worker".to_string());
        }

        if self.scenarios.namespace.trim().is_empty() {
            return Err("Scenario namespace cannot be empty".to_string());
        }

        if self.bootstrap.crowdsec_tries == 0 {
            return Err("CrowdSec install needs at least one try".to_string());
        }

        if self.bootstrap.crowdsec_tries > 1 && self.bootstrap.crowdsec_backoff_seconds.is_empty() {
            return Err("CrowdSec backoff schedule cannot be empty when retries are enabled".to_string());
        }

        if self.deployment.sync_tries > 1 && self.deployment.sync_backoff_seconds.is_empty() {
            return Err("Sync backoff schedule cannot be empty when retries are enabled".to_string());
        }

        let offsets = self.bootstrap.ordered_offsets();
        if offsets.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(format!(
                "Bootstrap offsets must be strictly increasing, got {:?}",
                offsets
            ));
        }

        if self.alerts.enabled && self.alerts.sync_interval_seconds == 0 {
            return Err("Alert sync interval must be positive".to_string());
        }

        for cidr in &self.bouncer.trusted_proxies {
            cidr.parse::<IpNet>()
                .map_err(|e| format!("Invalid trusted proxy range '{}': {}", cidr, e))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let settings = OrchestratorSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.bootstrap.crowdsec_offset_seconds, 120);
        assert_eq!(settings.bootstrap.crowdsec_backoff_seconds, vec![60, 300, 900]);
    }

    #[test]
    fn test_rejects_unordered_offsets() {
        let mut settings = OrchestratorSettings::default();
        settings.bootstrap.log_shipping_offset_seconds = 100;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_trusted_proxy() {
        let mut settings = OrchestratorSettings::default();
        settings.bouncer.trusted_proxies.push("not-a-cidr".to_string());
        let err = settings.validate().unwrap_err();
        assert!(err.contains("not-a-cidr"));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut settings = OrchestratorSettings::default();
        settings.scheduler.workers = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut settings = OrchestratorSettings::default();
        settings.scenarios.namespace = "acme".to_string();
        settings.bouncer.update_interval_seconds = 30;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(toml::to_string_pretty(&settings).unwrap().as_bytes())
            .unwrap();

        let stem = dir.path().join("orchestrator");
        let loaded = OrchestratorSettings::from_file(stem.to_str().unwrap()).unwrap();
        assert_eq!(loaded.scenarios.namespace, "acme");
        assert_eq!(loaded.bouncer.update_interval_seconds, 30);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_shipped_default_file_loads() {
        let path = format!("{}/../{}", env!("CARGO_MANIFEST_DIR"), DEFAULT_CONFIG_PATH);
        assert!(std::path::Path::new(&format!("{}.toml", path)).exists());

        let loaded = OrchestratorSettings::from_file(&path).unwrap();
        assert!(loaded.validate().is_ok());
        assert_eq!(loaded.scenarios.namespace, "bastion");
        assert_eq!(loaded.alerts.sync_interval_seconds, 300);
    }

    #[test]
    fn test_rejects_zero_alert_interval() {
        let mut settings = OrchestratorSettings::default();
        settings.alerts.sync_interval_seconds = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let loaded = OrchestratorSettings::from_file("/nonexistent/bastion").unwrap();
        assert_eq!(loaded.scheduler.workers, 4);
    }
}
