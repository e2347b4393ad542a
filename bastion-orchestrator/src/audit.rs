//! Compare the scenarios an application should have with what the engine
//! on its server has actually loaded

use bastion_common::ServerId;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, instrument};

use crate::engine::EngineApi;
use crate::error::{Result, SecurityError};
use crate::store::FirewallStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioAudit {
    pub app_uuid: String,
    pub server_id: ServerId,
    /// Compiled from the stored rules; empty while the firewall is inactive
    pub expected: Vec<String>,
    /// Loaded by the engine under the application's prefix
    pub deployed: Vec<String>,
    pub missing: Vec<String>,
    pub orphaned: Vec<String>,
    pub in_sync: bool,
}

#[instrument(skip(store, engine))]
pub async fn audit_scenarios(
    store: &FirewallStore,
    engine: &dyn EngineApi,
    app_uuid: &str,
) -> Result<ScenarioAudit> {
    let ctx = store.context_for_app(app_uuid)?;
    let compiler = store.compiler();

    let expected: BTreeSet<String> = if ctx.config.is_active() {
        compiler
            .compile_rule_set(&ctx)
            .map_err(SecurityError::from)?
            .into_iter()
            .map(|scenario| scenario.name)
            .collect()
    } else {
        BTreeSet::new()
    };

    let prefix = format!("{}/{}/", compiler.namespace(), ctx.app_uuid());
    let deployed: BTreeSet<String> = engine
        .list_scenarios(&ctx.server)
        .await?
        .into_iter()
        .filter(|name| name.starts_with(&prefix))
        .collect();

    let missing: Vec<String> = expected.difference(&deployed).cloned().collect();
    let orphaned: Vec<String> = deployed.difference(&expected).cloned().collect();
    let in_sync = missing.is_empty() && orphaned.is_empty();
    info!(
        server_id = ctx.server.id,
        missing = missing.len(),
        orphaned = orphaned.len(),
        "Scenario audit complete"
    );

    Ok(ScenarioAudit {
        app_uuid: ctx.app_uuid().to_string(),
        server_id: ctx.server.id,
        expected: expected.into_iter().collect(),
        deployed: deployed.into_iter().collect(),
        missing,
        orphaned,
        in_sync,
    })
}
