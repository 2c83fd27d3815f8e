//! Health, metrics and read-only reports.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::db::{AuditEntry, Certificate};
use crate::error::ControlError;
use crate::plane::{ConflictsView, PlaneHealth};

use super::AppState;

const DEFAULT_AUDIT_LIMIT: i64 = 100;
const MAX_AUDIT_LIMIT: i64 = 1000;

/// GET /health - 503 when the store is unreachable
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<PlaneHealth>) {
    let health = state.plane.health().await;
    let status = if health.store_error.is_none() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.plane.metrics().encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, switchyard_telemetry::metrics::CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /certificates
pub async fn list_certificates(
    State(state): State<AppState>,
) -> Result<Json<Vec<Certificate>>, ControlError> {
    Ok(Json(state.plane.certificates().await?))
}

/// GET /conflicts - current findings plus history
pub async fn list_conflicts(
    State(state): State<AppState>,
) -> Result<Json<ConflictsView>, ControlError> {
    Ok(Json(state.plane.conflicts().await?))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
}

/// GET /audit?limit=
pub async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, ControlError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .clamp(1, MAX_AUDIT_LIMIT);
    Ok(Json(state.plane.audit(limit).await?))
}
