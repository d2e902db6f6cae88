//! OptIn repository

use sqlx::PgPool;
use switchyard_common::types::{ContactId, OptInId, OrgId};

use crate::models::OptIn;

/// OptIn repository
#[derive(Clone)]
pub struct OptInRepository {
    pool: PgPool,
}

impl OptInRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// List an org's optins
    pub async fn for_org(&self, org_id: OrgId) -> Result<Vec<OptIn>, sqlx::Error> {
        sqlx::query_as::<_, OptIn>(
            "SELECT id, uuid, org_id, name FROM msgs_optin WHERE org_id = $1 ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
    }

    /// The contacts that have opted out of the given optin
    pub async fn opted_out_contact_ids(
        &self,
        org_id: OrgId,
        optin_id: OptInId,
    ) -> Result<Vec<ContactId>, sqlx::Error> {
        let rows: Vec<(ContactId,)> = sqlx::query_as(
            "SELECT contact_id FROM msgs_optout WHERE org_id = $1 AND optin_id = $2",
        )
        .bind(org_id)
        .bind(optin_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
