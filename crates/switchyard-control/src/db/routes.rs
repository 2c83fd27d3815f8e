//! Routes table access.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::models::Route;

/// Repository for route rows.
#[derive(Clone)]
pub struct RoutesRepository {
    pool: PgPool,
}

impl RoutesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// List all routes.
    pub async fn list(&self) -> Result<Vec<Route>, sqlx::Error> {
        sqlx::query_as::<_, Route>("SELECT * FROM routes ORDER BY name")
            .fetch_all(&self.pool)
            .await
    }

    /// Insert or overwrite a route by id.
    pub async fn upsert(conn: &mut PgConnection, route: &Route) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO routes (id, name, rule, service_ref, priority, entrypoints,
                tls_enabled, middleware_refs, status, source, metadata,
                created_at, created_by, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                rule = EXCLUDED.rule,
                service_ref = EXCLUDED.service_ref,
                priority = EXCLUDED.priority,
                entrypoints = EXCLUDED.entrypoints,
                tls_enabled = EXCLUDED.tls_enabled,
                middleware_refs = EXCLUDED.middleware_refs,
                status = EXCLUDED.status,
                source = EXCLUDED.source,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(route.id)
        .bind(&route.name)
        .bind(&route.rule)
        .bind(&route.service_ref)
        .bind(route.priority)
        .bind(&route.entrypoints)
        .bind(route.tls_enabled)
        .bind(&route.middleware_refs)
        .bind(route.status)
        .bind(route.source)
        .bind(&route.metadata)
        .bind(route.created_at)
        .bind(&route.created_by)
        .bind(route.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn delete(conn: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM routes WHERE id = $1")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_all(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM routes").execute(conn).await?;
        Ok(())
    }
}
