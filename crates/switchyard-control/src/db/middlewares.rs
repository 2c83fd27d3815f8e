//! Middlewares table access.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::models::Middleware;

/// Repository for middleware rows. `usage_count` is never stored.
#[derive(Clone)]
pub struct MiddlewaresRepository {
    pool: PgPool,
}

impl MiddlewaresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<Middleware>, sqlx::Error> {
        sqlx::query_as::<_, Middleware>("SELECT * FROM middlewares ORDER BY name")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn upsert(
        conn: &mut PgConnection,
        middleware: &Middleware,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO middlewares (id, name, middleware_type, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                middleware_type = EXCLUDED.middleware_type,
                config = EXCLUDED.config,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(middleware.id)
        .bind(&middleware.name)
        .bind(middleware.kind)
        .bind(&middleware.config)
        .bind(middleware.created_at)
        .bind(middleware.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn delete(conn: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM middlewares WHERE id = $1")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_all(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM middlewares").execute(conn).await?;
        Ok(())
    }
}
