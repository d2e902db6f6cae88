//! Contact repository

use std::collections::HashMap;

use chrono::Utc;
use sqlx::PgPool;
use switchyard_common::types::{ContactId, GroupId, OrgId, Urn};
use uuid::Uuid;

use crate::models::{Contact, ContactUrn};

/// Contact repository
#[derive(Clone)]
pub struct ContactRepository {
    pool: PgPool,
}

impl ContactRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load contacts by ID
    pub async fn load_by_ids(
        &self,
        org_id: OrgId,
        ids: &[ContactId],
    ) -> Result<Vec<Contact>, sqlx::Error> {
        sqlx::query_as::<_, Contact>(
            r#"
            SELECT id, uuid, org_id, name, language, status, created_on, modified_on, last_seen_on
            FROM contacts_contact
            WHERE org_id = $1 AND id = ANY($2)
            "#,
        )
        .bind(org_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
    }

    /// The contact IDs belonging to any of the given static groups
    pub async fn ids_for_groups(
        &self,
        group_ids: &[GroupId],
    ) -> Result<Vec<ContactId>, sqlx::Error> {
        let rows: Vec<(ContactId,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT contact_id
            FROM contacts_contactgroup_contacts
            WHERE contactgroup_id = ANY($1)
            "#,
        )
        .bind(group_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Load the URNs of the given contacts, highest priority first
    pub async fn urns_for_contacts(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> Result<Vec<ContactUrn>, sqlx::Error> {
        sqlx::query_as::<_, ContactUrn>(
            r#"
            SELECT id, org_id, contact_id, scheme, path, identity, priority
            FROM contacts_contacturn
            WHERE org_id = $1 AND contact_id = ANY($2)
            ORDER BY priority DESC, id
            "#,
        )
        .bind(org_id)
        .bind(contact_ids)
        .fetch_all(&self.pool)
        .await
    }

    /// Look up or create a contact for each of the given URNs, returning the
    /// URN to contact mapping.
    ///
    /// A URN row with a null `contact_id` is a detached address and gets
    /// reattached to a newly created contact rather than duplicated.
    pub async fn get_or_create_by_urns(
        &self,
        org_id: OrgId,
        urns: &[Urn],
    ) -> Result<HashMap<Urn, ContactId>, sqlx::Error> {
        let mut mapping = HashMap::with_capacity(urns.len());

        for urn in urns {
            let identity = urn.identity();

            let existing: Option<(i64, Option<ContactId>)> = sqlx::query_as(
                "SELECT id, contact_id FROM contacts_contacturn WHERE org_id = $1 AND identity = $2",
            )
            .bind(org_id)
            .bind(&identity)
            .fetch_optional(&self.pool)
            .await?;

            let contact_id = match existing {
                Some((_, Some(contact_id))) => contact_id,
                Some((urn_id, None)) => {
                    // orphaned URN, attach it to a fresh contact
                    let contact_id = self.insert_contact(org_id).await?;
                    sqlx::query("UPDATE contacts_contacturn SET contact_id = $2 WHERE id = $1")
                        .bind(urn_id)
                        .bind(contact_id)
                        .execute(&self.pool)
                        .await?;
                    contact_id
                }
                None => {
                    let contact_id = self.insert_contact(org_id).await?;
                    sqlx::query(
                        r#"
                        INSERT INTO contacts_contacturn (org_id, contact_id, scheme, path, identity, priority)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        "#,
                    )
                    .bind(org_id)
                    .bind(contact_id)
                    .bind(urn.scheme())
                    .bind(urn.path())
                    .bind(&identity)
                    .bind(1000)
                    .execute(&self.pool)
                    .await?;
                    contact_id
                }
            };

            mapping.insert(urn.clone(), contact_id);
        }

        Ok(mapping)
    }

    async fn insert_contact(&self, org_id: OrgId) -> Result<ContactId, sqlx::Error> {
        let now = Utc::now();
        let row: (ContactId,) = sqlx::query_as(
            r#"
            INSERT INTO contacts_contact (uuid, org_id, status, created_on, modified_on)
            VALUES ($1, $2, 'A', $3, $3)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }
}
