//! Snapshot table and published pointer access.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{ConfigSnapshot, SnapshotSummary};

/// Repository for config snapshots.
#[derive(Clone)]
pub struct SnapshotsRepository {
    pool: PgPool,
}

impl SnapshotsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, snapshot: &ConfigSnapshot) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO config_snapshots (id, label, created_at, created_by, is_automatic,
                config_data, rendered_file_content, checksum, restored_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(snapshot.id)
        .bind(&snapshot.label)
        .bind(snapshot.created_at)
        .bind(&snapshot.created_by)
        .bind(snapshot.is_automatic)
        .bind(Json(&snapshot.config_data))
        .bind(&snapshot.rendered_file_content)
        .bind(&snapshot.checksum)
        .bind(snapshot.restored_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ConfigSnapshot>, sqlx::Error> {
        sqlx::query_as::<_, ConfigSnapshot>("SELECT * FROM config_snapshots WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// List snapshots newest first, without loading rendered documents.
    pub async fn list(&self) -> Result<Vec<SnapshotSummary>, sqlx::Error> {
        let snapshots = sqlx::query_as::<_, ConfigSnapshot>(
            r#"
            SELECT id, label, created_at, created_by, is_automatic, config_data,
                NULL::TEXT AS rendered_file_content, checksum, restored_at
            FROM config_snapshots
            ORDER BY seq DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(snapshots.iter().map(ConfigSnapshot::summary).collect())
    }

    pub async fn mark_restored(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE config_snapshots SET restored_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_many(&self, ids: &[Uuid]) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM config_snapshots WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn published(&self) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>("SELECT snapshot_id FROM published_pointer")
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn set_published(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO published_pointer (singleton, snapshot_id, updated_at)
            VALUES (TRUE, $1, NOW())
            ON CONFLICT (singleton) DO UPDATE SET
                snapshot_id = EXCLUDED.snapshot_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
