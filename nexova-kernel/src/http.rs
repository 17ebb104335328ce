/**
 * API REST NEXOVA - Surface HTTP du kernel (lecture seule)
 *
 * RÔLE :
 * Expose l'état de la simulation aux dashboards et outils : flotte, lectures
 * récentes, alertes, trace d'audit des décisions, profils, santé du kernel.
 * Le flux temps réel passe par /ws (Broadcast Hub).
 *
 * Routes :
 * - GET /health, /system/health
 * - GET /machines, /machines/{id}/readings?limit=
 * - GET /alerts?limit=, /decisions?limit=
 * - GET /profiles
 * - GET /ws
 */

use crate::health::{HealthTracker, KernelHealth};
use crate::hub::BroadcastHub;
use crate::models::{Alert, DecisionAuditRecord, Machine, TelemetryReading};
use crate::profiles::{MachineProfile, ProfileTable};
use crate::store::{JsonStore, TelemetrySink};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<JsonStore>,
    pub hub: Arc<BroadcastHub>,
    pub health: HealthTracker,
    pub profiles: Arc<ProfileTable>,
    pub outbound_buffer: usize,
}

#[derive(Debug, Deserialize, Default)]
pub struct LimitParams {
    limit: Option<usize>,
}

impl LimitParams {
    fn resolve(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/machines", get(get_machines))
        .route("/machines/{id}/readings", get(get_readings))
        .route("/alerts", get(get_alerts))
        .route("/decisions", get(get_decisions))
        .route("/profiles", get(get_profiles))
        .route("/ws", get(crate::ws::ws_handler))
        .with_state(app_state)
}

async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(app.hub.len()))
}

async fn get_machines(State(app): State<AppState>) -> Json<Vec<Machine>> {
    Json(app.store.machines())
}

async fn get_readings(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<TelemetryReading>>, StatusCode> {
    if app.store.machine(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    app.store
        .query_recent(&id, params.resolve())
        .await
        .map(Json)
        .map_err(|e| {
            error!(machine_id = %id, error = %e, "reading history query failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_alerts(State(app): State<AppState>, Query(params): Query<LimitParams>) -> Json<Vec<Alert>> {
    Json(app.store.recent_alerts(params.resolve()))
}

async fn get_decisions(State(app): State<AppState>, Query(params): Query<LimitParams>) -> Json<Vec<DecisionAuditRecord>> {
    Json(app.store.recent_decisions(params.resolve()))
}

async fn get_profiles(State(app): State<AppState>) -> Json<HashMap<String, MachineProfile>> {
    Json(app.profiles.entries().clone())
}
