//! Control plane errors and their RFC 9457 Problem Details rendering.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use switchyard_rules::{ConflictReport, RuleError};
use thiserror::Error;
use uuid::Uuid;

use crate::db::StoreError;
use crate::publisher::PublishError;
use crate::renderer::RenderError;

/// Every failure a control plane operation can report.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("E2201: validation failed: {0}")]
    Validation(String),

    #[error("E2202: {0} not found")]
    NotFound(String),

    #[error("E2203: route conflicts detected ({} error(s))", .0.errors.len())]
    Conflict(ConflictReport),

    #[error("E2210: {0} already exists")]
    AlreadyExists(String),

    #[error("E2204: {entity} '{name}' is referenced by active route(s): {}", .dependents.join(", "))]
    ReferentialConflict {
        entity: &'static str,
        name: String,
        dependents: Vec<String>,
    },

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Health gating gave up. Converted into a rollback before it reaches callers.
    #[error("E2205: proxy did not become healthy: {0}")]
    HealthCheckTimeout(String),

    #[error("E2206: publish failed health checks and was rolled back to snapshot {snapshot_id}: {reason}")]
    PublishFailedRolledBack {
        reason: String,
        snapshot_id: Uuid,
        drift: Option<String>,
    },

    #[error("E2207: rollback to snapshot {snapshot_id} failed: {reason}")]
    RollbackFailure { reason: String, snapshot_id: Uuid },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("E2208: certificate source error: {0}")]
    CertificateSource(String),

    #[error("E2209: container runtime error: {0}")]
    ContainerRuntime(String),
}

impl From<RuleError> for ControlError {
    fn from(err: RuleError) -> Self {
        Self::Validation(format!("invalid rule: {err}"))
    }
}

impl ControlError {
    pub fn not_found(what: impl std::fmt::Display, key: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{what} '{key}'"))
    }

    /// Whether this error was raised before anything was written.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotFound(_)
                | Self::Conflict(_)
                | Self::ReferentialConflict { .. }
                | Self::AlreadyExists(_)
        )
    }
}

/// RFC 9457 Problem Details response.
#[derive(Debug, Clone, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub error_type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationIssue>,
    /// Full conflict report for 409 conflict responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ConflictReport>,
}

/// A single validation issue.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl ProblemDetails {
    fn new(kind: &str, title: &str, status: u16, detail: Option<String>) -> Self {
        Self {
            error_type: format!("urn:switchyard:error:{kind}"),
            title: title.into(),
            status,
            detail,
            instance: None,
            errors: vec![],
            report: None,
        }
    }

    /// Create a 404 Not Found error.
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new("not-found", "Not Found", 404, Some(detail.into()))
    }

    /// Create a 400 Bad Request error.
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new("bad-request", "Bad Request", 400, Some(detail.into()))
    }

    /// Create a 409 Conflict error.
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new("conflict", "Conflict", 409, Some(detail.into()))
    }

    /// Create a 409 error carrying a conflict detector report.
    pub fn route_conflict(report: ConflictReport) -> Self {
        let mut problem = Self::new(
            "route-conflict",
            "Route Conflict",
            409,
            Some(format!("{} conflicting route(s)", report.errors.len())),
        );
        problem.errors = report
            .errors
            .iter()
            .map(|c| ValidationIssue {
                code: c.kind.as_str().into(),
                message: c.message.clone(),
                location: Some(format!("{} <-> {}", c.route_a, c.route_b)),
            })
            .collect();
        problem.report = Some(report);
        problem
    }

    /// Create a 409 error listing entities that still depend on a target.
    pub fn referential_conflict(detail: impl Into<String>, dependents: &[String]) -> Self {
        let mut problem = Self::new(
            "referential-conflict",
            "Referential Conflict",
            409,
            Some(detail.into()),
        );
        problem.errors = dependents
            .iter()
            .map(|name| ValidationIssue {
                code: "dependent_route".into(),
                message: format!("route '{name}' still references this entity"),
                location: Some(name.clone()),
            })
            .collect();
        problem
    }

    /// Create a 500 Internal Server Error.
    pub fn internal_error() -> Self {
        Self::new("internal-error", "Internal Server Error", 500, None)
    }

    /// Create a 500 Internal Server Error with details.
    pub fn internal_error_with_detail(detail: impl Into<String>) -> Self {
        Self::new("internal-error", "Internal Server Error", 500, Some(detail.into()))
    }

    /// Create a 502 error for a publish that was rolled back.
    pub fn rolled_back(detail: impl Into<String>) -> Self {
        Self::new(
            "publish-rolled-back",
            "Publish Rolled Back",
            502,
            Some(detail.into()),
        )
    }

    /// Create a 503 Service Unavailable error.
    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new(
            "service-unavailable",
            "Service Unavailable",
            503,
            Some(detail.into()),
        )
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Json(&self).into_response();
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<ControlError> for ProblemDetails {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Validation(_) => Self::bad_request(err.to_string()),
            ControlError::NotFound(_) => Self::not_found(err.to_string()),
            ControlError::Conflict(report) => Self::route_conflict(report),
            ControlError::AlreadyExists(_) => Self::conflict(err.to_string()),
            ControlError::ReferentialConflict { ref dependents, .. } => {
                let dependents = dependents.clone();
                Self::referential_conflict(err.to_string(), &dependents)
            }
            ControlError::Render(ref e) => {
                tracing::error!(error = %e, "render failed");
                Self::internal_error_with_detail(err.to_string())
            }
            ControlError::Publish(ref e) => {
                tracing::error!(error = %e, "publish failed");
                Self::internal_error_with_detail(err.to_string())
            }
            ControlError::PublishFailedRolledBack { .. } => Self::rolled_back(err.to_string()),
            ControlError::RollbackFailure { .. } | ControlError::HealthCheckTimeout(_) => {
                Self::internal_error_with_detail(err.to_string())
            }
            ControlError::Store(StoreError::UniqueViolation(ref what)) => {
                Self::conflict(format!("{what} already exists"))
            }
            ControlError::Store(ref e) => {
                tracing::error!(error = %e, "store error");
                Self::internal_error()
            }
            ControlError::CertificateSource(_) | ControlError::ContainerRuntime(_) => {
                Self::service_unavailable(err.to_string())
            }
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        ProblemDetails::from(self).into_response()
    }
}
