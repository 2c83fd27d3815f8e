//! Middlewares API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::db::{Middleware, NewMiddleware, UpdateMiddleware};
use crate::error::ControlError;
use crate::orchestrator::Applied;
use crate::repository::NameFilter;

use super::{Actor, AppState, ForceQuery};

/// GET /middlewares - includes usage counts
pub async fn list_middlewares(
    State(state): State<AppState>,
    Query(filter): Query<NameFilter>,
) -> Result<Json<Vec<Middleware>>, ControlError> {
    Ok(Json(state.plane.repository().list_middlewares(&filter).await?))
}

/// GET /middlewares/{id}
pub async fn get_middleware(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Middleware>, ControlError> {
    Ok(Json(state.plane.repository().get_middleware(&id).await?))
}

/// POST /middlewares
pub async fn create_middleware(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    Json(input): Json<NewMiddleware>,
) -> Result<(StatusCode, Json<Applied<Middleware>>), ControlError> {
    let applied = state.plane.create_middleware(&ctx, input).await?;
    Ok((StatusCode::CREATED, Json(applied)))
}

/// PUT /middlewares/{id}
pub async fn update_middleware(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    Path(id): Path<String>,
    Json(update): Json<UpdateMiddleware>,
) -> Result<Json<Applied<Middleware>>, ControlError> {
    Ok(Json(state.plane.update_middleware(&ctx, &id, update).await?))
}

/// DELETE /middlewares/{id}
pub async fn delete_middleware(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    Path(id): Path<String>,
    Query(query): Query<ForceQuery>,
) -> Result<Json<Applied<Middleware>>, ControlError> {
    Ok(Json(
        state.plane.delete_middleware(&ctx, &id, query.force).await?,
    ))
}
