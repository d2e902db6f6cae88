//! Per-org asset cache
//!
//! Loading an org's configuration (languages, channels, ticketers,
//! templates, optins, groups) costs several queries, so assets are cached
//! process-locally and refreshed lazily. Structural admin changes flush the
//! whole cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use switchyard_common::types::{GroupId, OrgId, TemplateId, TicketerId};
use switchyard_common::{Error, Result};
use switchyard_storage::models::{Channel, Group, OptIn, Org, Template, TemplateTranslation, Ticketer};
use switchyard_storage::repository::{OptInRepository, OrgRepository, TemplateRepository, TicketerRepository};
use switchyard_storage::DatabasePool;
use tokio::sync::RwLock;
use tracing::debug;

/// The cached configuration of one org
pub struct OrgAssets {
    org: Org,
    channels: Vec<Channel>,
    ticketers: Vec<Ticketer>,
    templates: Vec<Template>,
    template_translations: Vec<TemplateTranslation>,
    optins: Vec<OptIn>,
    groups: Vec<Group>,
}

impl OrgAssets {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        org: Org,
        channels: Vec<Channel>,
        ticketers: Vec<Ticketer>,
        templates: Vec<Template>,
        template_translations: Vec<TemplateTranslation>,
        optins: Vec<OptIn>,
        groups: Vec<Group>,
    ) -> Self {
        Self {
            org,
            channels,
            ticketers,
            templates,
            template_translations,
            optins,
            groups,
        }
    }

    pub fn org(&self) -> &Org {
        &self.org
    }

    pub fn org_id(&self) -> OrgId {
        self.org.id
    }

    /// The org's configured languages, first is the default
    pub fn languages(&self) -> &[String] {
        &self.org.languages
    }

    pub fn country(&self) -> Option<&str> {
        self.org.country.as_deref()
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group_by_id(&self, id: GroupId) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn optins(&self) -> &[OptIn] {
        &self.optins
    }

    pub fn ticketer_by_id(&self, id: TicketerId) -> Option<&Ticketer> {
        self.ticketers.iter().find(|t| t.id == id)
    }

    pub fn template_by_id(&self, id: TemplateId) -> Option<&Template> {
        self.templates.iter().find(|t| t.id == id)
    }

    /// The URN schemes some channel of this org can send to
    pub fn sendable_schemes(&self) -> HashSet<&str> {
        self.channels
            .iter()
            .flat_map(|c| c.schemes.iter().map(|s| s.as_str()))
            .collect()
    }

    /// Find the best translation of a template for a language and country:
    /// an exact language+country match wins, then a language match, then
    /// nothing
    pub fn template_translation(
        &self,
        template_id: TemplateId,
        language: &str,
        country: Option<&str>,
    ) -> Option<&TemplateTranslation> {
        let candidates: Vec<&TemplateTranslation> = self
            .template_translations
            .iter()
            .filter(|tt| tt.template_id == template_id)
            .collect();

        if let Some(country) = country {
            if let Some(exact) = candidates
                .iter()
                .find(|tt| tt.language == language && tt.country.as_deref() == Some(country))
            {
                return Some(exact);
            }
        }

        candidates.into_iter().find(|tt| tt.language == language)
    }
}

/// Process-local org asset cache
#[derive(Clone, Default)]
pub struct AssetCache {
    inner: Arc<RwLock<HashMap<OrgId, Arc<OrgAssets>>>>,
}

impl AssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the assets for an org, loading them on first use
    pub async fn get(&self, db: &DatabasePool, org_id: OrgId) -> Result<Arc<OrgAssets>> {
        {
            let cache = self.inner.read().await;
            if let Some(assets) = cache.get(&org_id) {
                return Ok(assets.clone());
            }
        }

        self.refresh(db, org_id).await
    }

    /// Reload an org's assets from the database, replacing any cached entry
    pub async fn refresh(&self, db: &DatabasePool, org_id: OrgId) -> Result<Arc<OrgAssets>> {
        let assets = Arc::new(load_org_assets(db, org_id).await?);

        let mut cache = self.inner.write().await;
        cache.insert(org_id, assets.clone());

        debug!(org_id, "loaded org assets");
        Ok(assets)
    }

    /// Drop every cached entry. Used by tests and after structural admin
    /// changes.
    pub async fn flush(&self) {
        let mut cache = self.inner.write().await;
        cache.clear();
    }
}

async fn load_org_assets(db: &DatabasePool, org_id: OrgId) -> Result<OrgAssets> {
    let pool = db.pool().clone();
    let orgs = OrgRepository::new(pool.clone());
    let ticketers = TicketerRepository::new(pool.clone());
    let templates = TemplateRepository::new(pool.clone());
    let optins = OptInRepository::new(pool);

    let org = orgs
        .get(org_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("org {}", org_id)))?;

    Ok(OrgAssets {
        channels: orgs.channels(org_id).await?,
        groups: orgs.groups(org_id).await?,
        ticketers: ticketers.for_org(org_id).await?,
        templates: templates.for_org(org_id).await?,
        template_translations: templates.translations_for_org(org_id).await?,
        optins: optins.for_org(org_id).await?,
        org,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn test_assets() -> OrgAssets {
        OrgAssets {
            org: Org {
                id: 1,
                name: "Nyaruka".to_string(),
                languages: vec!["eng".to_string(), "fra".to_string()],
                country: Some("EC".to_string()),
                created_on: Utc::now(),
            },
            channels: vec![Channel {
                id: 10,
                uuid: Uuid::new_v4(),
                org_id: 1,
                name: "Vonage".to_string(),
                schemes: vec!["tel".to_string()],
            }],
            ticketers: vec![],
            templates: vec![],
            template_translations: vec![
                TemplateTranslation {
                    id: 1,
                    template_id: 7,
                    channel_id: Some(10),
                    language: "eng".to_string(),
                    country: Some("US".to_string()),
                    content: "Hi {{1}}".to_string(),
                    variable_count: 1,
                },
                TemplateTranslation {
                    id: 2,
                    template_id: 7,
                    channel_id: Some(10),
                    language: "fra".to_string(),
                    country: None,
                    content: "Bonjour {{1}}".to_string(),
                    variable_count: 1,
                },
            ],
            optins: vec![],
            groups: vec![],
        }
    }

    #[test]
    fn test_language_and_country() {
        let assets = test_assets();
        assert_eq!(assets.languages(), &["eng".to_string(), "fra".to_string()]);
        assert_eq!(assets.org().default_language(), Some("eng"));
        assert_eq!(assets.country(), Some("EC"));
    }

    #[test]
    fn test_sendable_schemes() {
        let assets = test_assets();
        let schemes = assets.sendable_schemes();
        assert!(schemes.contains("tel"));
        assert!(!schemes.contains("facebook"));
    }

    #[test]
    fn test_template_translation_selection() {
        let assets = test_assets();

        // exact language + country match
        let tt = assets.template_translation(7, "eng", Some("US")).unwrap();
        assert_eq!(tt.id, 1);

        // language-only fallback
        let tt = assets.template_translation(7, "eng", Some("EC")).unwrap();
        assert_eq!(tt.id, 1);
        let tt = assets.template_translation(7, "fra", Some("EC")).unwrap();
        assert_eq!(tt.id, 2);

        // nothing for unknown languages or templates
        assert!(assets.template_translation(7, "spa", None).is_none());
        assert!(assets.template_translation(99, "eng", None).is_none());
    }
}
