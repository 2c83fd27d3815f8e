//! Audit log and conflict history access. Both tables are append-only.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::models::{AuditEntry, RouteConflict};

/// Repository for audit entries and persisted conflicts.
#[derive(Clone)]
pub struct AuditRepository {
    pool: PgPool,
}

#[derive(FromRow)]
struct ConflictRow {
    id: Uuid,
    route_a: String,
    route_b: String,
    route_id_a: Option<Uuid>,
    route_id_b: Option<Uuid>,
    kind: String,
    severity: String,
    message: String,
    resolved: bool,
    detected_at: DateTime<Utc>,
}

impl TryFrom<ConflictRow> for RouteConflict {
    type Error = serde_json::Error;

    fn try_from(row: ConflictRow) -> Result<Self, Self::Error> {
        Ok(RouteConflict {
            id: row.id,
            route_a: row.route_a,
            route_b: row.route_b,
            route_id_a: row.route_id_a,
            route_id_b: row.route_id_b,
            kind: serde_json::from_value(serde_json::Value::String(row.kind))?,
            severity: serde_json::from_value(serde_json::Value::String(row.severity))?,
            message: row.message,
            resolved: row.resolved,
            detected_at: row.detected_at,
        })
    }
}

impl AuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: &AuditEntry) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, entity_type, entity_id, entity_name, action, diff,
                actor, source_ip, success, result, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.entity_type)
        .bind(entry.entity_id)
        .bind(&entry.entity_name)
        .bind(&entry.action)
        .bind(&entry.diff)
        .bind(&entry.actor)
        .bind(&entry.source_ip)
        .bind(entry.success)
        .bind(&entry.result)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<AuditEntry>, sqlx::Error> {
        sqlx::query_as::<_, AuditEntry>("SELECT * FROM audit_log ORDER BY seq DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn record_conflicts(
        &self,
        conflicts: &[RouteConflict],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for conflict in conflicts {
            sqlx::query(
                r#"
                INSERT INTO route_conflicts (id, route_a, route_b, route_id_a, route_id_b,
                    kind, severity, message, resolved, detected_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(conflict.id)
            .bind(&conflict.route_a)
            .bind(&conflict.route_b)
            .bind(conflict.route_id_a)
            .bind(conflict.route_id_b)
            .bind(conflict.kind.as_str())
            .bind(conflict.severity.as_str())
            .bind(&conflict.message)
            .bind(conflict.resolved)
            .bind(conflict.detected_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn list_conflicts(
        &self,
        limit: i64,
    ) -> Result<Vec<RouteConflict>, super::store::StoreError> {
        let rows = sqlx::query_as::<_, ConflictRow>(
            "SELECT * FROM route_conflicts ORDER BY detected_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(RouteConflict::try_from)
            .collect::<Result<_, _>>()?)
    }
}
