//! Schedule repository

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use switchyard_common::types::ScheduleId;

use crate::models::Schedule;

/// Schedule repository
#[derive(Clone)]
pub struct ScheduleRepository {
    pool: PgPool,
}

impl ScheduleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Active schedules whose next fire time has passed
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, sqlx::Error> {
        sqlx::query_as::<_, Schedule>(
            r#"
            SELECT id, org_id, repeat_period, next_fire, last_fire, is_active
            FROM schedules_schedule
            WHERE is_active = TRUE AND next_fire IS NOT NULL AND next_fire <= $1
            ORDER BY next_fire
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    /// Record a fire, advancing or deactivating the schedule
    pub async fn mark_fired(
        &self,
        id: ScheduleId,
        fired: DateTime<Utc>,
        next_fire: Option<DateTime<Utc>>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE schedules_schedule
            SET last_fire = $2, next_fire = $3, is_active = ($3 IS NOT NULL)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(fired)
        .bind(next_fire)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
