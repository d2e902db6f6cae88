//! Outbound message repository

use sqlx::PgPool;
use switchyard_common::types::{BroadcastId, ContactId};

use crate::models::NewMsg;

/// Outbound message repository
#[derive(Clone)]
pub struct MsgRepository {
    pool: PgPool,
}

impl MsgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a batch of outbound messages in one transaction
    pub async fn insert_batch(&self, msgs: &[NewMsg]) -> Result<u64, sqlx::Error> {
        if msgs.is_empty() {
            return Ok(0);
        }

        let mut count = 0u64;
        let mut tx = self.pool.begin().await?;

        for msg in msgs {
            let result = sqlx::query(
                r#"
                INSERT INTO msgs_msg (
                    uuid, org_id, contact_id, urn, text, attachments, quick_replies,
                    locale, direction, status, failed_reason, broadcast_id, optin_id,
                    template_id, template_variables, error_count, created_on, modified_on
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'O', $9, $10, $11, $12, $13, $14, 0, $15, $15)
                "#,
            )
            .bind(msg.uuid)
            .bind(msg.org_id)
            .bind(msg.contact_id)
            .bind(&msg.urn)
            .bind(&msg.text)
            .bind(&msg.attachments)
            .bind(&msg.quick_replies)
            .bind(&msg.locale)
            .bind(&msg.status)
            .bind(&msg.failed_reason)
            .bind(msg.broadcast_id)
            .bind(msg.optin_id)
            .bind(msg.template_id)
            .bind(&msg.template_variables)
            .bind(msg.created_on)
            .execute(&mut *tx)
            .await?;

            count += result.rows_affected();
        }

        tx.commit().await?;
        Ok(count)
    }

    /// The contacts that already received messages from the given broadcast,
    /// used for the started-previously exclusion
    pub async fn contact_ids_for_broadcast(
        &self,
        broadcast_id: BroadcastId,
    ) -> Result<Vec<ContactId>, sqlx::Error> {
        let rows: Vec<(ContactId,)> =
            sqlx::query_as("SELECT DISTINCT contact_id FROM msgs_msg WHERE broadcast_id = $1")
                .bind(broadcast_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Put errored outbound messages back on the courier queue, up to the
    /// retry cap
    pub async fn retry_errored(&self, limit: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE msgs_msg SET status = 'Q', modified_on = NOW()
            WHERE id IN (
                SELECT id FROM msgs_msg
                WHERE direction = 'O' AND status = 'E' AND error_count < 3
                ORDER BY modified_on
                LIMIT $1
            )
            "#,
        )
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
