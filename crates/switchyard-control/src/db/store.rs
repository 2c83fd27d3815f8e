//! Storage abstraction shared by the PostgreSQL and in-memory backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::models::{
    AuditEntry, Certificate, Change, ConfigSnapshot, ConfigState, RouteConflict, SnapshotSummary,
};

/// Errors raised by a [`ConfigStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("E2101: database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("E2102: {0} already exists")]
    UniqueViolation(String),

    #[error("E2103: stored payload could not be decoded: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("E2104: store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Classify a database error, surfacing unique violations separately.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                let what = db_err
                    .constraint()
                    .map(str::to_string)
                    .unwrap_or_else(|| db_err.message().to_string());
                return Self::UniqueViolation(what);
            }
        }
        Self::Database(err)
    }
}

/// Source of truth for configuration records and their history.
///
/// `apply` and `replace_state` are all-or-nothing: either every change lands or
/// none does.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load every route, service and middleware, sorted by name.
    async fn load_state(&self) -> Result<ConfigState, StoreError>;

    /// Commit a batch of changes in one transaction.
    async fn apply(&self, changes: &[Change]) -> Result<(), StoreError>;

    /// Replace all routes, services and middlewares with `state`.
    async fn replace_state(&self, state: &ConfigState) -> Result<(), StoreError>;

    async fn list_certificates(&self) -> Result<Vec<Certificate>, StoreError>;

    async fn upsert_certificates(&self, certificates: &[Certificate]) -> Result<(), StoreError>;

    async fn insert_snapshot(&self, snapshot: &ConfigSnapshot) -> Result<(), StoreError>;

    async fn get_snapshot(&self, id: Uuid) -> Result<Option<ConfigSnapshot>, StoreError>;

    /// Newest first.
    async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, StoreError>;

    async fn mark_snapshot_restored(&self, id: Uuid, at: DateTime<Utc>)
        -> Result<(), StoreError>;

    async fn delete_snapshots(&self, ids: &[Uuid]) -> Result<u64, StoreError>;

    /// The snapshot whose rendered document is live, if any.
    async fn published_snapshot(&self) -> Result<Option<Uuid>, StoreError>;

    async fn set_published_snapshot(&self, id: Uuid) -> Result<(), StoreError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_audit(&self, limit: i64) -> Result<Vec<AuditEntry>, StoreError>;

    async fn record_conflicts(&self, conflicts: &[RouteConflict]) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_conflicts(&self, limit: i64) -> Result<Vec<RouteConflict>, StoreError>;

    /// Liveness check used by `/health`.
    async fn ping(&self) -> Result<(), StoreError>;
}
