//! Message template repository

use sqlx::PgPool;
use switchyard_common::types::OrgId;

use crate::models::{Template, TemplateTranslation};

/// Message template repository
#[derive(Clone)]
pub struct TemplateRepository {
    pool: PgPool,
}

impl TemplateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// List an org's templates
    pub async fn for_org(&self, org_id: OrgId) -> Result<Vec<Template>, sqlx::Error> {
        sqlx::query_as::<_, Template>(
            "SELECT id, org_id, name FROM templates_template WHERE org_id = $1 ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
    }

    /// List the approved translations of an org's templates
    pub async fn translations_for_org(
        &self,
        org_id: OrgId,
    ) -> Result<Vec<TemplateTranslation>, sqlx::Error> {
        sqlx::query_as::<_, TemplateTranslation>(
            r#"
            SELECT tt.id, tt.template_id, tt.channel_id, tt.language, tt.country,
                   tt.content, tt.variable_count
            FROM templates_translation tt
            JOIN templates_template t ON t.id = tt.template_id
            WHERE t.org_id = $1 AND tt.status = 'A'
            ORDER BY tt.id
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
    }
}
