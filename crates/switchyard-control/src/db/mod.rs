//! Persistence layer for the control plane.

mod audit;
mod certificates;
mod memory;
mod middlewares;
mod models;
mod pool;
mod postgres;
mod routes;
mod services;
mod snapshots;
mod store;

pub use memory::MemoryStore;
pub use models::*;
pub use pool::{create_pool, run_migrations};
pub use postgres::PgStore;
pub use store::{ConfigStore, StoreError};
