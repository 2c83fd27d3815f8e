//! Services table access.

use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::models::Service;

/// Repository for service rows.
#[derive(Clone)]
pub struct ServicesRepository {
    pool: PgPool,
}

impl ServicesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<Service>, sqlx::Error> {
        sqlx::query_as::<_, Service>("SELECT * FROM services ORDER BY name")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn upsert(conn: &mut PgConnection, service: &Service) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO services (id, name, service_type, backend_targets, health_check,
                status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                service_type = EXCLUDED.service_type,
                backend_targets = EXCLUDED.backend_targets,
                health_check = EXCLUDED.health_check,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(service.id)
        .bind(&service.name)
        .bind(service.kind)
        .bind(Json(&service.backend_targets))
        .bind(Json(&service.health_check))
        .bind(service.status)
        .bind(service.created_at)
        .bind(service.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn delete(conn: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM services WHERE id = $1")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_all(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM services").execute(conn).await?;
        Ok(())
    }
}
