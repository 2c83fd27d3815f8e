//! PostgreSQL-backed [`ConfigStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::audit::AuditRepository;
use super::certificates::CertificatesRepository;
use super::middlewares::MiddlewaresRepository;
use super::models::{
    AuditEntry, Certificate, Change, ConfigSnapshot, ConfigState, RouteConflict, SnapshotSummary,
};
use super::routes::RoutesRepository;
use super::services::ServicesRepository;
use super::snapshots::SnapshotsRepository;
use super::store::{ConfigStore, StoreError};

/// Store composed from the per-table repositories.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    routes: RoutesRepository,
    services: ServicesRepository,
    middlewares: MiddlewaresRepository,
    certificates: CertificatesRepository,
    snapshots: SnapshotsRepository,
    audit: AuditRepository,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            routes: RoutesRepository::new(pool.clone()),
            services: ServicesRepository::new(pool.clone()),
            middlewares: MiddlewaresRepository::new(pool.clone()),
            certificates: CertificatesRepository::new(pool.clone()),
            snapshots: SnapshotsRepository::new(pool.clone()),
            audit: AuditRepository::new(pool.clone()),
            pool,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn load_state(&self) -> Result<ConfigState, StoreError> {
        Ok(ConfigState {
            routes: self.routes.list().await?,
            services: self.services.list().await?,
            middlewares: self.middlewares.list().await?,
        })
    }

    async fn apply(&self, changes: &[Change]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for change in changes {
            let result = match change {
                Change::PutRoute(route) => RoutesRepository::upsert(&mut tx, route).await,
                Change::DeleteRoute(id) => RoutesRepository::delete(&mut tx, *id).await.map(drop),
                Change::PutService(service) => {
                    ServicesRepository::upsert(&mut tx, service).await
                }
                Change::DeleteService(id) => {
                    ServicesRepository::delete(&mut tx, *id).await.map(drop)
                }
                Change::PutMiddleware(middleware) => {
                    MiddlewaresRepository::upsert(&mut tx, middleware).await
                }
                Change::DeleteMiddleware(id) => {
                    MiddlewaresRepository::delete(&mut tx, *id).await.map(drop)
                }
            };
            // Dropping the transaction rolls it back.
            result.map_err(StoreError::from_sqlx)?;
        }
        tx.commit().await.map_err(StoreError::from_sqlx)
    }

    async fn replace_state(&self, state: &ConfigState) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        RoutesRepository::delete_all(&mut tx).await?;
        ServicesRepository::delete_all(&mut tx).await?;
        MiddlewaresRepository::delete_all(&mut tx).await?;
        for service in &state.services {
            ServicesRepository::upsert(&mut tx, service)
                .await
                .map_err(StoreError::from_sqlx)?;
        }
        for middleware in &state.middlewares {
            MiddlewaresRepository::upsert(&mut tx, middleware)
                .await
                .map_err(StoreError::from_sqlx)?;
        }
        for route in &state.routes {
            RoutesRepository::upsert(&mut tx, route)
                .await
                .map_err(StoreError::from_sqlx)?;
        }
        tx.commit().await.map_err(StoreError::from_sqlx)
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>, StoreError> {
        Ok(self.certificates.list().await?)
    }

    async fn upsert_certificates(&self, certificates: &[Certificate]) -> Result<(), StoreError> {
        Ok(self.certificates.upsert_many(certificates).await?)
    }

    async fn insert_snapshot(&self, snapshot: &ConfigSnapshot) -> Result<(), StoreError> {
        Ok(self.snapshots.insert(snapshot).await?)
    }

    async fn get_snapshot(&self, id: Uuid) -> Result<Option<ConfigSnapshot>, StoreError> {
        Ok(self.snapshots.get(id).await?)
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, StoreError> {
        Ok(self.snapshots.list().await?)
    }

    async fn mark_snapshot_restored(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(self.snapshots.mark_restored(id, at).await?)
    }

    async fn delete_snapshots(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        Ok(self.snapshots.delete_many(ids).await?)
    }

    async fn published_snapshot(&self) -> Result<Option<Uuid>, StoreError> {
        Ok(self.snapshots.published().await?)
    }

    async fn set_published_snapshot(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(self.snapshots.set_published(id).await?)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        Ok(self.audit.append(entry).await?)
    }

    async fn list_audit(&self, limit: i64) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self.audit.list(limit).await?)
    }

    async fn record_conflicts(&self, conflicts: &[RouteConflict]) -> Result<(), StoreError> {
        Ok(self.audit.record_conflicts(conflicts).await?)
    }

    async fn list_conflicts(&self, limit: i64) -> Result<Vec<RouteConflict>, StoreError> {
        self.audit.list_conflicts(limit).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
