//! Org repository

use sqlx::PgPool;
use switchyard_common::types::OrgId;

use crate::models::{Channel, Group, Org};

/// Org repository
#[derive(Clone)]
pub struct OrgRepository {
    pool: PgPool,
}

impl OrgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get an org by ID
    pub async fn get(&self, id: OrgId) -> Result<Option<Org>, sqlx::Error> {
        sqlx::query_as::<_, Org>(
            "SELECT id, name, languages, country, created_on FROM orgs_org WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// List an org's groups
    pub async fn groups(&self, org_id: OrgId) -> Result<Vec<Group>, sqlx::Error> {
        sqlx::query_as::<_, Group>(
            r#"
            SELECT id, uuid, org_id, name, query
            FROM contacts_contactgroup
            WHERE org_id = $1 AND is_active = TRUE
            ORDER BY id
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
    }

    /// List an org's channels
    pub async fn channels(&self, org_id: OrgId) -> Result<Vec<Channel>, sqlx::Error> {
        sqlx::query_as::<_, Channel>(
            r#"
            SELECT id, uuid, org_id, name, schemes
            FROM channels_channel
            WHERE org_id = $1 AND is_active = TRUE
            ORDER BY id
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
    }
}
