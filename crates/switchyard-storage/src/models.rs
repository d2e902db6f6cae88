//! Database models

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use switchyard_common::types::{
    BroadcastId, BroadcastRef, ChannelId, ContactId, GroupId, Language, OptInId, OrgId, ScheduleId,
    SessionId, TemplateId, TicketId, TicketerId, Urn, UserId,
};
use uuid::Uuid;

/// Org (tenant) model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Org {
    pub id: OrgId,
    pub name: String,
    /// Configured languages, the first one is the default
    pub languages: Vec<String>,
    pub country: Option<String>,
    pub created_on: DateTime<Utc>,
}

impl Org {
    /// The org's default language, i.e. the first configured one
    pub fn default_language(&self) -> Option<&str> {
        self.languages.first().map(|l| l.as_str())
    }
}

/// Contact model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: Option<String>,
    pub language: Option<String>,
    pub status: String,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub last_seen_on: Option<DateTime<Utc>>,
}

/// Contact URN model. `contact_id` is null when the URN has been detached
/// from its owner, never deleted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ContactUrn {
    pub id: i64,
    pub org_id: OrgId,
    pub contact_id: Option<ContactId>,
    pub scheme: String,
    pub path: String,
    pub identity: String,
    pub priority: i32,
}

impl ContactUrn {
    pub fn as_urn(&self) -> Option<Urn> {
        Urn::parse(&self.identity)
    }
}

/// Contact group model, either a static member set or a smart group backed
/// by a search query
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
    pub query: Option<String>,
}

impl Group {
    pub fn is_smart(&self) -> bool {
        self.query.as_deref().map(|q| !q.is_empty()).unwrap_or(false)
    }
}

/// Channel model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
    /// URN schemes this channel can send to
    pub schemes: Vec<String>,
}

/// OptIn model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OptIn {
    pub id: OptInId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
}

/// Message template model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub org_id: OrgId,
    pub name: String,
}

/// A single localized rendering of a template
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TemplateTranslation {
    pub id: i64,
    pub template_id: TemplateId,
    pub channel_id: Option<ChannelId>,
    pub language: String,
    pub country: Option<String>,
    /// Body with positional placeholders, e.g. `Hi {{1}}`
    pub content: String,
    pub variable_count: i32,
}

/// The content of a broadcast in a single language
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<String>,
}

impl TranslationContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: vec![],
            quick_replies: vec![],
        }
    }
}

/// Recipient exclusion flags on a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusions {
    /// Exclude contacts that aren't active
    #[serde(default)]
    pub non_active: bool,
    /// Exclude contacts currently waiting in a flow
    #[serde(default)]
    pub in_a_flow: bool,
    /// Exclude contacts that already received this broadcast's parent
    #[serde(default)]
    pub started_previously: bool,
    /// Exclude contacts opted out of this broadcast's optin
    #[serde(default)]
    pub unsubscribed: bool,
}

impl Exclusions {
    pub const NONE: Exclusions = Exclusions {
        non_active: false,
        in_a_flow: false,
        started_previously: false,
        unsubscribed: false,
    };
}

/// A send intent, either persisted as a `msgs_broadcast` row or carried
/// ephemerally as a task payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    #[serde(rename = "broadcast_id", default = "ephemeral")]
    pub id: BroadcastRef,
    pub org_id: OrgId,
    pub translations: HashMap<Language, TranslationContent>,
    pub base_language: Language,
    #[serde(default)]
    pub expressions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optin_id: Option<OptInId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<TemplateId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_variables: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_ids: Vec<GroupId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact_ids: Vec<ContactId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urns: Vec<Urn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub exclusions: Exclusions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<ScheduleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<BroadcastId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_id: Option<UserId>,
}

fn ephemeral() -> BroadcastRef {
    BroadcastRef::Ephemeral
}

impl Broadcast {
    /// Slice this broadcast into a batch for the given contacts, inheriting
    /// the rendering context
    pub fn create_batch(&self, contact_ids: Vec<ContactId>, is_last: bool) -> BroadcastBatch {
        BroadcastBatch {
            broadcast_id: self.id,
            org_id: self.org_id,
            translations: self.translations.clone(),
            base_language: self.base_language.clone(),
            expressions: self.expressions,
            optin_id: self.optin_id,
            template_id: self.template_id,
            template_variables: self.template_variables.clone(),
            contact_ids,
            is_last,
            urns: HashMap::new(),
        }
    }
}

/// A derived, transient slice of a broadcast carried as an independent task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastBatch {
    pub broadcast_id: BroadcastRef,
    pub org_id: OrgId,
    pub translations: HashMap<Language, TranslationContent>,
    pub base_language: Language,
    #[serde(default)]
    pub expressions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optin_id: Option<OptInId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<TemplateId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_variables: Vec<String>,
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub is_last: bool,
    /// Forced destination URNs for URN-only recipients, only ever set on
    /// the last batch
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub urns: HashMap<ContactId, Urn>,
}

/// An outbound message row to be inserted
#[derive(Debug, Clone)]
pub struct NewMsg {
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub urn: Option<String>,
    pub text: String,
    pub attachments: Vec<String>,
    pub quick_replies: Vec<String>,
    pub locale: Option<String>,
    pub status: String,
    pub failed_reason: Option<String>,
    pub broadcast_id: Option<BroadcastId>,
    pub optin_id: Option<OptInId>,
    pub template_id: Option<TemplateId>,
    pub template_variables: Vec<String>,
    pub created_on: DateTime<Utc>,
}

/// Ticket model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub ticketer_id: TicketerId,
    pub external_id: Option<String>,
    pub status: String,
    pub subject: String,
    pub body: String,
    pub config: serde_json::Value,
    pub opened_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub closed_on: Option<DateTime<Utc>>,
    pub last_activity_on: DateTime<Utc>,
}

impl Ticket {
    /// Look up a string value in this ticket's config
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

/// A ticket to be inserted, always created open
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub ticketer_id: TicketerId,
    pub external_id: Option<String>,
    pub subject: String,
    pub body: String,
    pub config: serde_json::Value,
}

/// Ticket audit event model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TicketEvent {
    pub id: i64,
    pub org_id: OrgId,
    pub ticket_id: TicketId,
    pub contact_id: ContactId,
    pub event_type: String,
    pub created_by_id: Option<UserId>,
    pub note: Option<String>,
    pub created_on: DateTime<Utc>,
}

/// A ticket event to be inserted
#[derive(Debug, Clone)]
pub struct NewTicketEvent {
    pub org_id: OrgId,
    pub ticket_id: TicketId,
    pub contact_id: ContactId,
    pub event_type: String,
    pub created_by_id: Option<UserId>,
    pub note: Option<String>,
}

/// Ticketer (provider configuration) model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Ticketer {
    pub id: TicketerId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub ticketer_type: String,
    pub name: String,
    pub config: serde_json::Value,
}

impl Ticketer {
    /// Look up a string value in this ticketer's config
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

/// An HTTP trace to be persisted as an audit row
#[derive(Debug, Clone)]
pub struct NewHttpLog {
    pub org_id: OrgId,
    pub ticketer_id: Option<TicketerId>,
    pub url: String,
    pub status_code: i32,
    pub request: String,
    pub response: Option<String>,
    pub request_time_ms: i32,
    pub is_error: bool,
    pub created_on: DateTime<Utc>,
}

/// Flow session model. The flow runtime owns these, we only read waits and
/// end them.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub status: String,
    pub created_on: DateTime<Utc>,
    pub timeout_on: Option<DateTime<Utc>>,
    pub wait_expires_on: Option<DateTime<Utc>>,
    pub ended_on: Option<DateTime<Utc>>,
}

/// Schedule model, linked from broadcasts that repeat
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub org_id: OrgId,
    /// 'O' once, 'D' daily, 'W' weekly, 'M' monthly
    pub repeat_period: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fire: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Schedule {
    /// The fire time after the given one, or None for one-off schedules
    pub fn fire_after(&self, fired: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.repeat_period.as_str() {
            "D" => Some(fired + chrono::Duration::days(1)),
            "W" => Some(fired + chrono::Duration::weeks(1)),
            "M" => fired.checked_add_months(chrono::Months::new(1)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_broadcast_serde() {
        let json = r#"{
            "broadcast_id": null,
            "org_id": 1,
            "translations": {"eng": {"text": "Hi there"}},
            "base_language": "eng",
            "contact_ids": [10, 11],
            "urns": ["tel:+593979012345"]
        }"#;

        let bcast: Broadcast = serde_json::from_str(json).unwrap();
        assert_eq!(bcast.id, BroadcastRef::Ephemeral);
        assert_eq!(bcast.org_id, 1);
        assert_eq!(bcast.translations["eng"].text, "Hi there");
        assert_eq!(bcast.contact_ids, vec![10, 11]);
        assert_eq!(bcast.urns[0].identity(), "tel:+593979012345");
        assert_eq!(bcast.exclusions, Exclusions::NONE);
        assert!(!bcast.expressions);
    }

    #[test]
    fn test_create_batch_inherits_context() {
        let mut translations = HashMap::new();
        translations.insert("eng".to_string(), TranslationContent::text("Hello"));

        let bcast = Broadcast {
            id: BroadcastRef::Persisted(42),
            org_id: 1,
            translations,
            base_language: "eng".to_string(),
            expressions: true,
            optin_id: Some(7),
            template_id: None,
            template_variables: vec![],
            group_ids: vec![],
            contact_ids: vec![1, 2, 3],
            urns: vec![],
            query: None,
            exclusions: Exclusions::NONE,
            schedule_id: None,
            parent_id: None,
            created_by_id: None,
        };

        let batch = bcast.create_batch(vec![1, 2], false);
        assert_eq!(batch.broadcast_id, BroadcastRef::Persisted(42));
        assert_eq!(batch.org_id, 1);
        assert_eq!(batch.base_language, "eng");
        assert!(batch.expressions);
        assert_eq!(batch.optin_id, Some(7));
        assert_eq!(batch.contact_ids, vec![1, 2]);
        assert!(!batch.is_last);
        assert!(batch.urns.is_empty());
    }

    #[test]
    fn test_batch_urns_serde() {
        let mut batch = BroadcastBatch {
            broadcast_id: BroadcastRef::Ephemeral,
            org_id: 1,
            translations: HashMap::new(),
            base_language: "eng".to_string(),
            expressions: false,
            optin_id: None,
            template_id: None,
            template_variables: vec![],
            contact_ids: vec![5],
            is_last: true,
            urns: HashMap::new(),
        };
        batch
            .urns
            .insert(5, Urn::parse("tel:+593979012345").unwrap());

        let encoded = serde_json::to_string(&batch).unwrap();
        let decoded: BroadcastBatch = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.is_last);
        assert_eq!(decoded.urns[&5].identity(), "tel:+593979012345");
    }

    #[test]
    fn test_schedule_fire_after() {
        let sched = Schedule {
            id: 1,
            org_id: 1,
            repeat_period: "D".to_string(),
            next_fire: None,
            last_fire: None,
            is_active: true,
        };
        let fired = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            sched.fire_after(fired),
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap())
        );

        let once = Schedule {
            repeat_period: "O".to_string(),
            ..sched.clone()
        };
        assert_eq!(once.fire_after(fired), None);
    }
}
