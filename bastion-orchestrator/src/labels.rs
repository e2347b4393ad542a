//! Reverse-proxy middleware labels wiring an application to the engine
//! bouncer. One namespace for the bouncer itself, an optional second one for
//! payload inspection.

use bastion_common::FirewallConfig;
use serde::Serialize;

use crate::config::{BouncerConfig, EngineConfig};

const MIDDLEWARE_PREFIX: &str = "traefik.http.middlewares";
const PLUGIN_SEGMENT: &str = "plugin.bouncer";

/// Ordered `(key, value)` pairs for one application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MiddlewareLabelSet {
    labels: Vec<(String, String)>,
    middlewares: Vec<String>,
}

impl MiddlewareLabelSet {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Middleware names to attach to the application's router, in order
    pub fn middleware_names(&self) -> &[String] {
        &self.middlewares
    }

    /// `key=value` lines as passed to the container runtime
    pub fn to_docker_labels(&self) -> Vec<String> {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    fn push_namespace(&mut self, middleware: String, settings: Vec<(&'static str, String)>) {
        let prefix = format!("{}.{}.{}", MIDDLEWARE_PREFIX, middleware, PLUGIN_SEGMENT);
        self.labels.extend(
            settings
                .into_iter()
                .map(|(setting, value)| (format!("{}.{}", prefix, setting), value)),
        );
        self.middlewares.push(middleware);
    }
}

/// Inputs for label generation that live outside the firewall config
#[derive(Debug, Clone, Copy)]
pub struct LabelContext<'a> {
    pub app_uuid: &'a str,
    pub config: &'a FirewallConfig,
    /// Payload inspection reachable on the application's server
    pub appsec_available: bool,
    pub has_enabled_path_only_rule: bool,
}

#[derive(Debug, Clone)]
pub struct LabelGenerator {
    bouncer: BouncerConfig,
    engine: EngineConfig,
}

impl LabelGenerator {
    pub fn new(bouncer: BouncerConfig, engine: EngineConfig) -> Self {
        Self { bouncer, engine }
    }

    pub fn bouncer_middleware(&self, app_uuid: &str) -> String {
        format!("{}-{}", self.bouncer.middleware_namespace, app_uuid)
    }

    pub fn appsec_middleware(&self, app_uuid: &str) -> String {
        format!("{}-{}", self.bouncer.appsec_namespace, app_uuid)
    }

    /// Payload inspection is all-or-nothing: every condition must hold
    pub fn appsec_gate(&self, ctx: &LabelContext<'_>) -> bool {
        self.bouncer.appsec_feature_enabled
            && ctx.config.appsec_enabled
            && ctx.appsec_available
            && (ctx.config.inband_enabled || ctx.has_enabled_path_only_rule)
    }

    pub fn generate(&self, ctx: &LabelContext<'_>) -> MiddlewareLabelSet {
        let mut set = MiddlewareLabelSet::default();
        if !ctx.config.is_active() {
            return set;
        }

        let mut bouncer = self.core_settings(ctx.config);
        bouncer.extend([
            ("crowdsecmode", self.bouncer.mode.clone()),
            ("defaultdecisionseconds", ctx.config.ban_duration.to_string()),
            (
                "updateintervalseconds",
                self.bouncer.update_interval_seconds.to_string(),
            ),
            ("loglevel", self.bouncer.log_level.clone()),
            (
                "forwardedheaderstrustedips",
                self.bouncer.trusted_proxies.join(","),
            ),
            ("rediscacheenabled", "false".to_string()),
            ("localcacheenabled", self.bouncer.local_cache.to_string()),
            (
                "httptimeoutseconds",
                self.bouncer.http_timeout_seconds.to_string(),
            ),
            (
                "remediationstatuscode",
                self.bouncer.blocked_status_code.to_string(),
            ),
        ]);
        set.push_namespace(self.bouncer_middleware(ctx.app_uuid), bouncer);

        if self.appsec_gate(ctx) {
            let mut appsec = self.core_settings(ctx.config);
            appsec.extend([
                ("crowdsecappsecenabled", "true".to_string()),
                ("crowdsecappsechost", self.engine.appsec_host.clone()),
                ("crowdsecappsecfailureblock", "true".to_string()),
                ("crowdsecappsecunreachableblock", "false".to_string()),
            ]);
            set.push_namespace(self.appsec_middleware(ctx.app_uuid), appsec);
        }

        set
    }

    fn core_settings(&self, config: &FirewallConfig) -> Vec<(&'static str, String)> {
        vec![
            ("enabled", "true".to_string()),
            ("crowdseclapikey", config.api_key.clone()),
            ("crowdseclapihost", self.engine.lapi_host.clone()),
            ("crowdseclapischeme", self.engine.lapi_scheme.clone()),
        ]
    }
}
