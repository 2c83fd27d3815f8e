//! REST API handlers for the control plane.

mod actor;
mod middlewares;
mod observability;
mod publishing;
mod router;
mod routes;
mod services;
mod snapshots;

#[cfg(test)]
mod tests;

pub use actor::Actor;
pub use router::{create_router, AppState};

use serde::Deserialize;

/// `?force=true` on writes that can be overridden.
#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: bool,
}
