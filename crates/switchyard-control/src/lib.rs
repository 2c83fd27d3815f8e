//! Switchyard control plane.
//!
//! Stores routes, services and middlewares, checks every change with the
//! conflict detector, renders the proxy's dynamic configuration and publishes
//! it atomically. A publish is health gated: if the proxy does not come back
//! healthy the previous snapshot is restored.

pub mod api;
pub mod certificates;
pub mod config;
pub mod context;
pub mod db;
pub mod discovery;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod plane;
pub mod publisher;
pub mod renderer;
pub mod repository;
pub mod server;
pub mod snapshot;

#[cfg(test)]
mod testing;
