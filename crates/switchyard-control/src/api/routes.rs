//! Routes API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::db::{NewRoute, Route, UpdateRoute};
use crate::error::ControlError;
use crate::orchestrator::Applied;
use crate::repository::RouteFilter;

use super::{Actor, AppState, ForceQuery};

/// GET /routes
pub async fn list_routes(
    State(state): State<AppState>,
    Query(filter): Query<RouteFilter>,
) -> Result<Json<Vec<Route>>, ControlError> {
    Ok(Json(state.plane.repository().list_routes(&filter).await?))
}

/// GET /routes/{id} - by id or name
pub async fn get_route(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Route>, ControlError> {
    Ok(Json(state.plane.repository().get_route(&id).await?))
}

/// POST /routes
pub async fn create_route(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    Query(query): Query<ForceQuery>,
    Json(input): Json<NewRoute>,
) -> Result<(StatusCode, Json<Applied<Route>>), ControlError> {
    let applied = state.plane.create_route(&ctx, input, query.force).await?;
    Ok((StatusCode::CREATED, Json(applied)))
}

/// PUT /routes/{id}
pub async fn update_route(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    Path(id): Path<String>,
    Query(query): Query<ForceQuery>,
    Json(update): Json<UpdateRoute>,
) -> Result<Json<Applied<Route>>, ControlError> {
    Ok(Json(
        state.plane.update_route(&ctx, &id, update, query.force).await?,
    ))
}

/// DELETE /routes/{id}
pub async fn delete_route(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    Path(id): Path<String>,
) -> Result<Json<Applied<Route>>, ControlError> {
    Ok(Json(state.plane.delete_route(&ctx, &id).await?))
}
