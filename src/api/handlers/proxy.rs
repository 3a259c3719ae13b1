//! Egress proxy handlers

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::server::AppState;
use crate::error::VeilError;
use crate::mediator::MediatedRequest;
use crate::models::{AnonymityLevel, ProxyPreference};

/// Pool and anonymity network overview
#[derive(Debug, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub anonymity_network_available: bool,
    pub circuit_established: bool,
    pub vpn_pools: Vec<String>,
    pub proxy_pools: Vec<String>,
    pub active_proxy: String,
    pub anonymity_level: AnonymityLevel,
    pub request_count: u64,
    pub last_rotation: DateTime<Utc>,
}

/// Query parameters for rotation
#[derive(Debug, Deserialize, Default)]
pub struct RotateQuery {
    pub proxy_type: Option<String>,
}

/// Run one outbound call through the pool
pub async fn mediate_request(
    State(state): State<AppState>,
    Json(req): Json<MediatedRequest>,
) -> Result<impl IntoResponse, VeilError> {
    let response = state.mediator.mediate(req).await?;
    Ok(Json(response))
}

/// Current pool and controller state
pub async fn proxy_status(State(state): State<AppState>) -> impl IntoResponse {
    let anonymity_network_available = state.controller.is_available().await;
    let circuit_established =
        anonymity_network_available && state.controller.is_circuit_established().await;
    let active = state.pool.active();

    Json(ProxyStatus {
        anonymity_network_available,
        circuit_established,
        vpn_pools: state.pool.vpn_pools(),
        proxy_pools: state.pool.proxy_pools(),
        active_proxy: active.name,
        anonymity_level: active.anonymity_level,
        request_count: state.pool.request_count(),
        last_rotation: state.pool.last_rotation(),
    })
}

/// Rotate the active path, optionally within one kind
pub async fn rotate(
    State(state): State<AppState>,
    Query(query): Query<RotateQuery>,
) -> Result<impl IntoResponse, VeilError> {
    let kind = match query.proxy_type.as_deref() {
        None | Some("") => None,
        Some(raw) => ProxyPreference::from_str(raw)
            .ok_or_else(|| VeilError::UnsupportedProxyType(raw.to_string()))?
            .kind(),
    };

    let outcome = state.mediator.rotate(kind).await;
    info!(
        rotated = outcome.rotated,
        active = %outcome.active_proxy,
        new_identity = outcome.new_identity,
        "Rotation requested"
    );

    Ok(Json(outcome))
}

/// Circuit counts from the anonymity network daemon
pub async fn circuits(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.get_circuit_info().await)
}
