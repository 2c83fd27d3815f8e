//! Snapshots API handlers.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::{ConfigSnapshot, SnapshotSummary};
use crate::error::ControlError;
use crate::snapshot::{RestoreResult, SnapshotBundle};

use super::{Actor, AppState};

#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    pub label: String,
}

/// GET /snapshots - newest first, without document bodies
pub async fn list_snapshots(
    State(state): State<AppState>,
) -> Result<Json<Vec<SnapshotSummary>>, ControlError> {
    Ok(Json(state.plane.list_snapshots().await?))
}

/// POST /snapshots - manual capture
pub async fn capture_snapshot(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    Json(request): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<SnapshotSummary>), ControlError> {
    if request.label.trim().is_empty() {
        return Err(ControlError::Validation("snapshot label must not be empty".into()));
    }
    let snapshot = state.plane.capture_snapshot(&ctx, &request.label).await?;
    Ok((StatusCode::CREATED, Json(snapshot.summary())))
}

/// GET /snapshots/{id}
pub async fn get_snapshot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConfigSnapshot>, ControlError> {
    Ok(Json(state.plane.get_snapshot(id).await?))
}

/// POST /snapshots/{id}/restore
pub async fn restore_snapshot(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<RestoreResult>, ControlError> {
    Ok(Json(state.plane.restore_snapshot(&ctx, id).await?))
}

/// GET /snapshots/{id}/export - portable bundle as a download
pub async fn export_snapshot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ControlError> {
    let bundle = state.plane.export_snapshot(id).await?;
    let disposition = format!("attachment; filename=\"switchyard-snapshot-{id}.json\"");
    Ok((
        [(header::CONTENT_DISPOSITION, disposition)],
        Json(bundle),
    ))
}

/// POST /snapshots/import - validate and store a bundle; nothing is applied
pub async fn import_snapshot(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    Json(bundle): Json<SnapshotBundle>,
) -> Result<(StatusCode, Json<SnapshotSummary>), ControlError> {
    let snapshot = state.plane.import_snapshot(&ctx, bundle).await?;
    Ok((StatusCode::CREATED, Json(snapshot.summary())))
}
