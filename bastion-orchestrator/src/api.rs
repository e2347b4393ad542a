//! Management HTTP API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use bastion_common::{Application, FirewallConfig, FirewallRule, Server, ServerId, TrafficMetrics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, instrument};

use crate::alerts::{AlertStore, FirewallAlert};
use crate::audit::{audit_scenarios, ScenarioAudit};
use crate::compiler::ScenarioFile;
use crate::engine::EngineApi;
use crate::error::SecurityError;
use crate::events::{EventBus, EventPublisher, ServerEvent};
use crate::labels::{LabelContext, LabelGenerator, MiddlewareLabelSet};
use crate::metrics::{TrafficMetricsCollector, TrafficRecord};
use crate::registry::ServerRegistry;
use crate::store::{ConfigUpdate, FirewallStore};
use crate::templates::{self, RuleTemplate};

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<FirewallStore>,
    pub registry: Arc<ServerRegistry>,
    pub engine: Arc<dyn EngineApi>,
    pub alerts: Arc<AlertStore>,
    pub labels: Arc<LabelGenerator>,
    pub server_events: Arc<EventBus<ServerEvent>>,
    pub traffic: Arc<TrafficMetricsCollector>,
    pub started_at: DateTime<Utc>,
}

/// Error body returned by every failing handler
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub struct ApiError(SecurityError);

impl From<SecurityError> for ApiError {
    fn from(err: SecurityError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            SecurityError::Compilation(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            SecurityError::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            SecurityError::Configuration(_) | SecurityError::Validation(_) => {
                (StatusCode::BAD_REQUEST, self.0.to_string())
            }
            _ => {
                error!(error = %self.0, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/applications", post(register_application))
        .route("/api/v1/applications/:uuid/firewall", put(update_firewall))
        .route("/api/v1/applications/:uuid/labels", get(get_labels))
        .route("/api/v1/applications/:uuid/rules", post(save_rule))
        .route("/api/v1/applications/:uuid/rules/:id", delete(delete_rule))
        .route("/api/v1/applications/:uuid/scenarios", get(preview_scenarios))
        .route("/api/v1/applications/:uuid/scenarios/audit", get(audit_application))
        .route("/api/v1/applications/:uuid/templates/:key", post(apply_template))
        .route("/api/v1/applications/:uuid/geo-block", post(geo_block))
        .route("/api/v1/applications/:uuid/alerts", get(get_alerts))
        .route("/api/v1/applications/:uuid/traffic", get(get_traffic))
        .route("/api/v1/templates", get(list_templates))
        .route("/api/v1/servers", post(register_server))
        .route("/api/v1/servers/:id", get(get_server))
        .route("/api/v1/servers/:id/reachable", post(server_reachable))
        .route("/api/v1/traffic", post(ingest_traffic))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "servers": state.registry.list().len(),
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
    }))
}

// ============================================================================
// Applications and rules
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterApplicationRequest {
    pub application: Application,
    pub firewall: FirewallConfig,
}

#[instrument(skip(state, request), fields(app_uuid = %request.application.uuid))]
async fn register_application(
    State(state): State<AppState>,
    Json(request): Json<RegisterApplicationRequest>,
) -> ApiResult<(StatusCode, Json<Application>)> {
    let application = request.application.clone();
    state
        .store
        .register_application(request.application, request.firewall)?;
    Ok((StatusCode::CREATED, Json(application)))
}

async fn update_firewall(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(update): Json<ConfigUpdate>,
) -> ApiResult<Json<FirewallConfig>> {
    Ok(Json(state.store.update_config(&uuid, update).await?))
}

async fn get_labels(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<MiddlewareLabelSet>> {
    let ctx = state.store.context_for_app(&uuid)?;
    let labels = state.labels.generate(&LabelContext {
        app_uuid: ctx.app_uuid(),
        config: &ctx.config,
        appsec_available: ctx.server.status.appsec_available,
        has_enabled_path_only_rule: ctx.has_enabled_path_only_rule(),
    });
    Ok(Json(labels))
}

async fn save_rule(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(rule): Json<FirewallRule>,
) -> ApiResult<(StatusCode, Json<FirewallRule>)> {
    let saved = state.store.save_rule(&uuid, rule).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path((uuid, rule_id)): Path<(String, u64)>,
) -> ApiResult<Json<FirewallRule>> {
    Ok(Json(state.store.delete_rule(&uuid, rule_id).await?))
}

/// Scenario files that the next sync would upload
async fn preview_scenarios(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<Vec<ScenarioFile>>> {
    let ctx = state.store.context_for_app(&uuid)?;
    let compiler = state.store.compiler();
    let files = compiler
        .compile_rule_set(&ctx)
        .map_err(SecurityError::from)?
        .iter()
        .map(|scenario| compiler.render(scenario))
        .collect::<Result<Vec<_>, _>>()
        .map_err(SecurityError::from)?;
    Ok(Json(files))
}

/// Expected scenarios against the ones the engine has loaded
async fn audit_application(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<ScenarioAudit>> {
    Ok(Json(audit_scenarios(&state.store, state.engine.as_ref(), &uuid).await?))
}

async fn list_templates() -> Json<Vec<RuleTemplate>> {
    Json(templates::catalog())
}

async fn apply_template(
    State(state): State<AppState>,
    Path((uuid, key)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<FirewallRule>)> {
    let rule = templates::find(&key)?.instantiate();
    let saved = state.store.save_rule(&uuid, rule).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

#[derive(Debug, Deserialize)]
pub struct GeoBlockRequest {
    pub countries: Vec<String>,
}

async fn geo_block(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(request): Json<GeoBlockRequest>,
) -> ApiResult<(StatusCode, Json<FirewallRule>)> {
    let rule = templates::geo_block_rule(&request.countries)?;
    let saved = state.store.save_rule(&uuid, rule).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

/// Recorded engine alerts, newest first
async fn get_alerts(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<Vec<FirewallAlert>>> {
    state.store.application(&uuid)?;
    Ok(Json(state.alerts.for_application(&uuid)))
}

async fn get_traffic(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<TrafficMetrics>> {
    state.store.application(&uuid)?;
    let metrics = state
        .traffic
        .snapshot(&uuid)
        .map_err(|e| SecurityError::Validation(e.to_string()))?;
    Ok(Json(metrics))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrafficIngestResponse {
    pub accepted: usize,
}

async fn ingest_traffic(
    State(state): State<AppState>,
    Json(records): Json<Vec<TrafficRecord>>,
) -> Json<TrafficIngestResponse> {
    Json(TrafficIngestResponse {
        accepted: state.traffic.ingest(&records),
    })
}

// ============================================================================
// Servers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterServerRequest {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
}

#[instrument(skip(state, request), fields(server_id = request.id))]
async fn register_server(
    State(state): State<AppState>,
    Json(request): Json<RegisterServerRequest>,
) -> ApiResult<(StatusCode, Json<Server>)> {
    if state.registry.get(request.id).is_ok() {
        return Err(SecurityError::Validation(format!("server {} already registered", request.id)).into());
    }

    let mut server = Server::new(request.id, request.name, request.host);
    if let Some(user) = request.user {
        server.user = user;
    }
    if let Some(port) = request.port {
        server.port = port;
    }
    state.registry.insert(server.clone());

    let subscribers = state
        .server_events
        .publish(ServerEvent::Created { server_id: server.id })
        .await;
    info!(subscribers, "Server created event published");
    Ok((StatusCode::CREATED, Json(server)))
}

async fn get_server(
    State(state): State<AppState>,
    Path(server_id): Path<ServerId>,
) -> ApiResult<Json<Server>> {
    Ok(Json(state.registry.get(server_id)?))
}

async fn server_reachable(
    State(state): State<AppState>,
    Path(server_id): Path<ServerId>,
) -> ApiResult<StatusCode> {
    state.registry.get(server_id)?;
    state
        .server_events
        .publish(ServerEvent::BecameReachable { server_id })
        .await;
    Ok(StatusCode::ACCEPTED)
}
