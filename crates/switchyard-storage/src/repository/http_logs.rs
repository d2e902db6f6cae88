//! HTTP log repository

use sqlx::PgPool;

use crate::models::NewHttpLog;

/// HTTP log repository
#[derive(Clone)]
pub struct HttpLogRepository {
    pool: PgPool,
}

impl HttpLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist the given traces. Always called after a provider request,
    /// whether it succeeded or not.
    pub async fn insert_all(&self, logs: &[NewHttpLog]) -> Result<(), sqlx::Error> {
        for log in logs {
            sqlx::query(
                r#"
                INSERT INTO http_log (org_id, ticketer_id, url, status_code, request, response,
                                      request_time_ms, is_error, created_on)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(log.org_id)
            .bind(log.ticketer_id)
            .bind(&log.url)
            .bind(log.status_code)
            .bind(&log.request)
            .bind(&log.response)
            .bind(log.request_time_ms)
            .bind(log.is_error)
            .bind(log.created_on)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
