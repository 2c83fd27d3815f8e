//! Axum router configuration.

use std::sync::Arc;

use axum::{
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};

use crate::plane::ControlPlane;

use super::{middlewares, observability, publishing, routes, services, snapshots};

/// API version header value.
const API_VERSION: &str = "application/vnd.switchyard.v1+json";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub plane: Arc<ControlPlane>,
}

/// Create the API router with all routes.
pub fn create_router(plane: Arc<ControlPlane>) -> Router {
    let state = AppState { plane };

    Router::new()
        // Health and metrics
        .route("/health", get(observability::health))
        .route("/metrics", get(observability::metrics))
        // Routes
        .route("/routes", get(routes::list_routes).post(routes::create_route))
        .route(
            "/routes/{id}",
            get(routes::get_route)
                .put(routes::update_route)
                .delete(routes::delete_route),
        )
        // Services
        .route(
            "/services",
            get(services::list_services).post(services::create_service),
        )
        .route(
            "/services/{id}",
            get(services::get_service)
                .put(services::update_service)
                .delete(services::delete_service),
        )
        // Middlewares
        .route(
            "/middlewares",
            get(middlewares::list_middlewares).post(middlewares::create_middleware),
        )
        .route(
            "/middlewares/{id}",
            get(middlewares::get_middleware)
                .put(middlewares::update_middleware)
                .delete(middlewares::delete_middleware),
        )
        // Validation and publishing
        .route("/validate", post(publishing::validate))
        .route(
            "/publish",
            post(publishing::publish).get(publishing::publish_status),
        )
        // Snapshots
        .route(
            "/snapshots",
            get(snapshots::list_snapshots).post(snapshots::capture_snapshot),
        )
        .route("/snapshots/import", post(snapshots::import_snapshot))
        .route("/snapshots/{id}", get(snapshots::get_snapshot))
        .route("/snapshots/{id}/restore", post(snapshots::restore_snapshot))
        .route("/snapshots/{id}/export", get(snapshots::export_snapshot))
        // Reports
        .route("/certificates", get(observability::list_certificates))
        .route("/conflicts", get(observability::list_conflicts))
        .route("/audit", get(observability::list_audit))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-switchyard-api"),
            HeaderValue::from_static(API_VERSION),
        ))
        .with_state(state)
}
