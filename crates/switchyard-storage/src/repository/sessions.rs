//! Flow session repository
//!
//! The flow runtime owns session rows; this tier only reads waits and ends
//! sessions whose deadlines have elapsed.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use switchyard_common::types::{ContactId, OrgId, SessionId};

use crate::models::Session;

const SELECT_SESSION: &str = r#"
SELECT id, org_id, contact_id, status, created_on, timeout_on, wait_expires_on, ended_on
FROM flows_flowsession
"#;

/// Flow session repository
#[derive(Clone)]
pub struct SessionRepository {
    pool: PgPool,
}

impl SessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a session by ID
    pub async fn get(&self, id: SessionId) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as::<_, Session>(&format!("{} WHERE id = $1", SELECT_SESSION))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Waiting sessions whose timeout has elapsed
    pub async fn timed_out(&self, now: DateTime<Utc>) -> Result<Vec<Session>, sqlx::Error> {
        sqlx::query_as::<_, Session>(&format!(
            "{} WHERE status = 'W' AND timeout_on <= $1 ORDER BY timeout_on",
            SELECT_SESSION
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    /// Waiting sessions whose wait has expired
    pub async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Session>, sqlx::Error> {
        sqlx::query_as::<_, Session>(&format!(
            "{} WHERE status = 'W' AND wait_expires_on <= $1 ORDER BY wait_expires_on",
            SELECT_SESSION
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    /// The contacts currently waiting in a flow, used for broadcast
    /// exclusions
    pub async fn waiting_contact_ids(&self, org_id: OrgId) -> Result<Vec<ContactId>, sqlx::Error> {
        let rows: Vec<(ContactId,)> = sqlx::query_as(
            "SELECT DISTINCT contact_id FROM flows_flowsession WHERE org_id = $1 AND status = 'W'",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// End a waiting session. Returns false if the session was no longer
    /// waiting, which makes deadline handling idempotent.
    pub async fn end(
        &self,
        id: SessionId,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE flows_flowsession
            SET status = $2, ended_on = $3, timeout_on = NULL, wait_expires_on = NULL
            WHERE id = $1 AND status = 'W'
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Interrupt all waiting sessions belonging to blocked or stopped
    /// contacts, returning how many were ended
    pub async fn interrupt_for_inactive_contacts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE flows_flowsession s
            SET status = 'I', ended_on = $1, timeout_on = NULL, wait_expires_on = NULL
            FROM contacts_contact c
            WHERE s.contact_id = c.id AND s.status = 'W' AND c.status IN ('B', 'S')
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
