//! Services API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::db::{NewService, Service, UpdateService};
use crate::error::ControlError;
use crate::orchestrator::Applied;
use crate::repository::NameFilter;

use super::{Actor, AppState, ForceQuery};

/// GET /services
pub async fn list_services(
    State(state): State<AppState>,
    Query(filter): Query<NameFilter>,
) -> Result<Json<Vec<Service>>, ControlError> {
    Ok(Json(state.plane.repository().list_services(&filter).await?))
}

/// GET /services/{id}
pub async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Service>, ControlError> {
    Ok(Json(state.plane.repository().get_service(&id).await?))
}

/// POST /services
pub async fn create_service(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    Json(input): Json<NewService>,
) -> Result<(StatusCode, Json<Applied<Service>>), ControlError> {
    let applied = state.plane.create_service(&ctx, input).await?;
    Ok((StatusCode::CREATED, Json(applied)))
}

/// PUT /services/{id} - disabling or retyping a used service needs `force`
pub async fn update_service(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    Path(id): Path<String>,
    Query(query): Query<ForceQuery>,
    Json(update): Json<UpdateService>,
) -> Result<Json<Applied<Service>>, ControlError> {
    Ok(Json(
        state.plane.update_service(&ctx, &id, update, query.force).await?,
    ))
}

/// DELETE /services/{id} - `force` cascades to dependent routes
pub async fn delete_service(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    Path(id): Path<String>,
    Query(query): Query<ForceQuery>,
) -> Result<Json<Applied<Service>>, ControlError> {
    Ok(Json(state.plane.delete_service(&ctx, &id, query.force).await?))
}
