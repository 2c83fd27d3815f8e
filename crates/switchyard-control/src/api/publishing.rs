//! Dry-run validation and manual publishing.

use axum::{extract::State, Json};
use serde::Serialize;
use switchyard_rules::ConflictReport;
use uuid::Uuid;

use crate::error::ControlError;
use crate::orchestrator::PublishReport;
use crate::repository::RouteDraft;

use super::{Actor, AppState};

/// POST /validate - run the conflict detector on a draft, write nothing
pub async fn validate(
    State(state): State<AppState>,
    Json(draft): Json<RouteDraft>,
) -> Result<Json<ConflictReport>, ControlError> {
    Ok(Json(state.plane.validate_route(&draft).await?))
}

/// POST /publish - re-render and publish the stored state
pub async fn publish(
    State(state): State<AppState>,
    Actor(ctx): Actor,
) -> Result<Json<PublishReport>, ControlError> {
    Ok(Json(state.plane.publish(&ctx).await?))
}

#[derive(Serialize)]
pub struct PublishStatus {
    pub published_snapshot: Option<Uuid>,
    pub live_checksum: Option<String>,
    pub last_publish: Option<PublishReport>,
}

/// GET /publish - what is live right now
pub async fn publish_status(
    State(state): State<AppState>,
) -> Result<Json<PublishStatus>, ControlError> {
    let live = state.plane.publisher().current().await?;
    Ok(Json(PublishStatus {
        published_snapshot: state.plane.store().published_snapshot().await?,
        live_checksum: live.as_deref().map(crate::renderer::checksum),
        last_publish: state.plane.orchestrator().last_publish(),
    }))
}
