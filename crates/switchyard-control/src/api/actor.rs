//! Caller identity from request headers.

use std::convert::Infallible;

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::context::OperationContext;

pub const ACTOR_HEADER: &str = "x-switchyard-actor";
pub const ROLE_HEADER: &str = "x-switchyard-role";

const ANONYMOUS: &str = "anonymous";

/// The operation context of the request. Authentication happens in front of
/// the control plane; this only carries what it asserted.
#[derive(Debug, Clone)]
pub struct Actor(pub OperationContext);

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor = header(parts, ACTOR_HEADER).unwrap_or_else(|| ANONYMOUS.to_string());
        let source_ip = header(parts, "x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
            .or_else(|| header(parts, "x-real-ip"));
        Ok(Self(
            OperationContext::new(actor)
                .with_role(header(parts, ROLE_HEADER))
                .with_source_ip(source_ip),
        ))
    }
}
