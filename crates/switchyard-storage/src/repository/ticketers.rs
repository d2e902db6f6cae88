//! Ticketer repository

use sqlx::PgPool;
use switchyard_common::types::{OrgId, TicketerId};

use crate::models::Ticketer;

/// Ticketer repository
#[derive(Clone)]
pub struct TicketerRepository {
    pool: PgPool,
}

impl TicketerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a ticketer by ID
    pub async fn get(&self, id: TicketerId) -> Result<Option<Ticketer>, sqlx::Error> {
        sqlx::query_as::<_, Ticketer>(
            r#"
            SELECT id, uuid, org_id, ticketer_type, name, config
            FROM tickets_ticketer
            WHERE id = $1 AND is_active = TRUE
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// List an org's active ticketers
    pub async fn for_org(&self, org_id: OrgId) -> Result<Vec<Ticketer>, sqlx::Error> {
        sqlx::query_as::<_, Ticketer>(
            r#"
            SELECT id, uuid, org_id, ticketer_type, name, config
            FROM tickets_ticketer
            WHERE org_id = $1 AND is_active = TRUE
            ORDER BY created_on
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
    }
}
