//! Ticket repository

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Postgres;
use switchyard_common::types::{ContactId, OrgId, TicketId, TicketerId};
use uuid::Uuid;

use crate::models::{NewTicket, NewTicketEvent, Ticket};

const SELECT_TICKET: &str = r#"
SELECT id, uuid, org_id, contact_id, ticketer_id, external_id, status, subject,
       body, config, opened_on, modified_on, closed_on, last_activity_on
FROM tickets_ticket
"#;

/// Ticket repository
#[derive(Clone)]
pub struct TicketRepository {
    pool: PgPool,
}

impl TicketRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert new tickets, all created open, returning the full rows
    pub async fn insert(&self, tickets: &[NewTicket]) -> Result<Vec<Ticket>, sqlx::Error> {
        let now = Utc::now();
        let mut inserted = Vec::with_capacity(tickets.len());
        let mut tx = self.pool.begin().await?;

        for t in tickets {
            let ticket: Ticket = sqlx::query_as(
                r#"
                INSERT INTO tickets_ticket (
                    uuid, org_id, contact_id, ticketer_id, external_id, status,
                    subject, body, config, opened_on, modified_on, last_activity_on
                )
                VALUES ($1, $2, $3, $4, $5, 'O', $6, $7, $8, $9, $9, $9)
                RETURNING id, uuid, org_id, contact_id, ticketer_id, external_id, status,
                          subject, body, config, opened_on, modified_on, closed_on, last_activity_on
                "#,
            )
            .bind(t.uuid)
            .bind(t.org_id)
            .bind(t.contact_id)
            .bind(t.ticketer_id)
            .bind(&t.external_id)
            .bind(&t.subject)
            .bind(&t.body)
            .bind(&t.config)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            inserted.push(ticket);
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Look up a ticket by UUID
    pub async fn by_uuid(&self, uuid: Uuid) -> Result<Option<Ticket>, sqlx::Error> {
        sqlx::query_as::<_, Ticket>(&format!("{} WHERE uuid = $1", SELECT_TICKET))
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
    }

    /// Look up a ticket by its ticketer and external handle
    pub async fn by_external_id(
        &self,
        ticketer_id: TicketerId,
        external_id: &str,
    ) -> Result<Option<Ticket>, sqlx::Error> {
        sqlx::query_as::<_, Ticket>(&format!(
            "{} WHERE ticketer_id = $1 AND external_id = $2",
            SELECT_TICKET
        ))
        .bind(ticketer_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Load tickets by ID
    pub async fn load_by_ids(&self, ids: &[TicketId]) -> Result<Vec<Ticket>, sqlx::Error> {
        sqlx::query_as::<_, Ticket>(&format!("{} WHERE id = ANY($1)", SELECT_TICKET))
            .bind(ids)
            .fetch_all(&self.pool)
            .await
    }

    /// The open tickets for a contact, newest first. Used to route inbound
    /// messages to an agent conversation.
    pub async fn open_for_contact(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
    ) -> Result<Vec<Ticket>, sqlx::Error> {
        sqlx::query_as::<_, Ticket>(&format!(
            "{} WHERE org_id = $1 AND contact_id = $2 AND status = 'O' ORDER BY opened_on DESC",
            SELECT_TICKET
        ))
        .bind(org_id)
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Mark the given tickets closed and append their events, in one
    /// transaction
    pub async fn close(
        &self,
        ids: &[TicketId],
        now: DateTime<Utc>,
        events: &[NewTicketEvent],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE tickets_ticket
            SET status = 'C', modified_on = $2, closed_on = $2, last_activity_on = $2
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        insert_events(&mut tx, events, now).await?;

        tx.commit().await
    }

    /// Mark the given tickets open again and append their events, in one
    /// transaction
    pub async fn reopen(
        &self,
        ids: &[TicketId],
        now: DateTime<Utc>,
        events: &[NewTicketEvent],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE tickets_ticket
            SET status = 'O', modified_on = $2, closed_on = NULL, last_activity_on = $2
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        insert_events(&mut tx, events, now).await?;

        tx.commit().await
    }

    /// Append events for the given tickets without a status change
    pub async fn insert_events(&self, events: &[NewTicketEvent]) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        insert_events(&mut tx, events, now).await?;
        tx.commit().await
    }

    /// Bump `last_activity_on` without any status change
    pub async fn update_last_activity(
        &self,
        ids: &[TicketId],
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tickets_ticket SET last_activity_on = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Merge the given keys into a ticket's config
    pub async fn update_config(
        &self,
        id: TicketId,
        config: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tickets_ticket SET config = config || $2::jsonb WHERE id = $1")
            .bind(id)
            .bind(config)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Set a ticket's external provider handle
    pub async fn update_external_id(
        &self,
        id: TicketId,
        external_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tickets_ticket SET external_id = $2 WHERE id = $1")
            .bind(id)
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn insert_events(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    events: &[NewTicketEvent],
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    for e in events {
        sqlx::query(
            r#"
            INSERT INTO tickets_ticketevent (org_id, ticket_id, contact_id, event_type, created_by_id, note, created_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(e.org_id)
        .bind(e.ticket_id)
        .bind(e.contact_id)
        .bind(&e.event_type)
        .bind(e.created_by_id)
        .bind(&e.note)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}
