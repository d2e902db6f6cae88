//! Broadcast repository

use chrono::Utc;
use sqlx::{FromRow, PgPool};
use switchyard_common::types::{
    BroadcastId, BroadcastRef, ContactId, GroupId, OptInId, OrgId, ScheduleId, TemplateId, Urn,
    UserId,
};

use crate::models::{Broadcast, Exclusions};

#[derive(FromRow)]
struct BroadcastRow {
    id: BroadcastId,
    org_id: OrgId,
    translations: serde_json::Value,
    base_language: String,
    expressions: bool,
    optin_id: Option<OptInId>,
    template_id: Option<TemplateId>,
    template_variables: Option<Vec<String>>,
    query: Option<String>,
    exclusions: serde_json::Value,
    schedule_id: Option<ScheduleId>,
    parent_id: Option<BroadcastId>,
    created_by_id: Option<UserId>,
}

impl BroadcastRow {
    fn into_broadcast(
        self,
        group_ids: Vec<GroupId>,
        contact_ids: Vec<ContactId>,
        urns: Vec<Urn>,
    ) -> Result<Broadcast, serde_json::Error> {
        Ok(Broadcast {
            id: BroadcastRef::Persisted(self.id),
            org_id: self.org_id,
            translations: serde_json::from_value(self.translations)?,
            base_language: self.base_language,
            expressions: self.expressions,
            optin_id: self.optin_id,
            template_id: self.template_id,
            template_variables: self.template_variables.unwrap_or_default(),
            group_ids,
            contact_ids,
            urns,
            query: self.query,
            exclusions: serde_json::from_value::<Exclusions>(self.exclusions).unwrap_or_default(),
            schedule_id: self.schedule_id,
            parent_id: self.parent_id,
            created_by_id: self.created_by_id,
        })
    }
}

/// Broadcast repository
#[derive(Clone)]
pub struct BroadcastRepository {
    pool: PgPool,
}

impl BroadcastRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a broadcast and its recipient junction rows, setting the
    /// broadcast's ID to the new row's
    pub async fn insert(&self, bcast: &mut Broadcast) -> Result<BroadcastId, sqlx::Error> {
        let now = Utc::now();
        let translations =
            serde_json::to_value(&bcast.translations).map_err(|e| sqlx::Error::Encode(e.into()))?;
        let exclusions =
            serde_json::to_value(bcast.exclusions).map_err(|e| sqlx::Error::Encode(e.into()))?;

        let mut tx = self.pool.begin().await?;

        let row: (BroadcastId,) = sqlx::query_as(
            r#"
            INSERT INTO msgs_broadcast (
                org_id, translations, base_language, expressions, optin_id,
                template_id, template_variables, query, exclusions,
                schedule_id, parent_id, created_by_id, status, created_on, modified_on
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'Q', $13, $13)
            RETURNING id
            "#,
        )
        .bind(bcast.org_id)
        .bind(&translations)
        .bind(&bcast.base_language)
        .bind(bcast.expressions)
        .bind(bcast.optin_id)
        .bind(bcast.template_id)
        .bind(&bcast.template_variables)
        .bind(&bcast.query)
        .bind(&exclusions)
        .bind(bcast.schedule_id)
        .bind(bcast.parent_id)
        .bind(bcast.created_by_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let id = row.0;

        for group_id in &bcast.group_ids {
            sqlx::query(
                "INSERT INTO msgs_broadcast_groups (broadcast_id, contactgroup_id) VALUES ($1, $2)",
            )
            .bind(id)
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        }

        for contact_id in &bcast.contact_ids {
            sqlx::query(
                "INSERT INTO msgs_broadcast_contacts (broadcast_id, contact_id) VALUES ($1, $2)",
            )
            .bind(id)
            .bind(contact_id)
            .execute(&mut *tx)
            .await?;
        }

        for urn in &bcast.urns {
            sqlx::query("INSERT INTO msgs_broadcast_urns (broadcast_id, urn) VALUES ($1, $2)")
                .bind(id)
                .bind(urn.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        bcast.id = BroadcastRef::Persisted(id);
        Ok(id)
    }

    /// Insert a new broadcast as a child of the given one, inheriting its
    /// content and recipients. Used when a scheduled broadcast fires.
    pub async fn insert_child(&self, parent: &Broadcast) -> Result<Broadcast, sqlx::Error> {
        let mut child = parent.clone();
        child.id = BroadcastRef::Ephemeral;
        child.parent_id = parent.id.id();
        child.schedule_id = None;

        self.insert(&mut child).await?;
        Ok(child)
    }

    /// Load a broadcast by ID
    pub async fn get(&self, id: BroadcastId) -> Result<Option<Broadcast>, sqlx::Error> {
        let row: Option<BroadcastRow> = sqlx::query_as(
            r#"
            SELECT id, org_id, translations, base_language, expressions, optin_id,
                   template_id, template_variables, query, exclusions,
                   schedule_id, parent_id, created_by_id
            FROM msgs_broadcast
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    /// Load the broadcast linked to the given schedule
    pub async fn get_for_schedule(
        &self,
        schedule_id: ScheduleId,
    ) -> Result<Option<Broadcast>, sqlx::Error> {
        let row: Option<BroadcastRow> = sqlx::query_as(
            r#"
            SELECT id, org_id, translations, base_language, expressions, optin_id,
                   template_id, template_variables, query, exclusions,
                   schedule_id, parent_id, created_by_id
            FROM msgs_broadcast
            WHERE schedule_id = $1
            "#,
        )
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn hydrate(&self, row: BroadcastRow) -> Result<Broadcast, sqlx::Error> {
        let id = row.id;

        let groups: Vec<(GroupId,)> = sqlx::query_as(
            "SELECT contactgroup_id FROM msgs_broadcast_groups WHERE broadcast_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let contacts: Vec<(ContactId,)> =
            sqlx::query_as("SELECT contact_id FROM msgs_broadcast_contacts WHERE broadcast_id = $1")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        let urns: Vec<(String,)> =
            sqlx::query_as("SELECT urn FROM msgs_broadcast_urns WHERE broadcast_id = $1")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        row.into_broadcast(
            groups.into_iter().map(|(g,)| g).collect(),
            contacts.into_iter().map(|(c,)| c).collect(),
            urns.into_iter().filter_map(|(u,)| Urn::parse(&u)).collect(),
        )
        .map_err(|e| sqlx::Error::Decode(e.into()))
    }

    /// Mark a broadcast as sent, done exactly once when its last batch
    /// completes
    pub async fn mark_sent(&self, id: BroadcastId) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE msgs_broadcast SET status = 'S', modified_on = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
