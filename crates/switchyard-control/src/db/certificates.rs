//! Certificates table access.

use sqlx::PgPool;

use super::models::Certificate;

/// Repository for certificate rows, keyed by domain.
#[derive(Clone)]
pub struct CertificatesRepository {
    pool: PgPool,
}

impl CertificatesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<Certificate>, sqlx::Error> {
        sqlx::query_as::<_, Certificate>("SELECT * FROM certificates ORDER BY domain")
            .fetch_all(&self.pool)
            .await
    }

    /// Insert or refresh certificate rows in one transaction.
    pub async fn upsert_many(&self, certificates: &[Certificate]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for cert in certificates {
            sqlx::query(
                r#"
                INSERT INTO certificates (domain, resolver, status, issued_at, expires_at, last_checked_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (domain) DO UPDATE SET
                    resolver = EXCLUDED.resolver,
                    status = EXCLUDED.status,
                    issued_at = EXCLUDED.issued_at,
                    expires_at = EXCLUDED.expires_at,
                    last_checked_at = EXCLUDED.last_checked_at
                "#,
            )
            .bind(&cert.domain)
            .bind(&cert.resolver)
            .bind(cert.status)
            .bind(cert.issued_at)
            .bind(cert.expires_at)
            .bind(cert.last_checked_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}
