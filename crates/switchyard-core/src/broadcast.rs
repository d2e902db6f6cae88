//! Broadcast fan-out and message rendering
//!
//! A `send_broadcast` task expands the broadcast's recipients (explicit
//! contacts, groups, a search query and raw URNs, minus exclusions) into
//! `send_broadcast_batch` tasks of up to 100 contacts. Each batch renders
//! one outbound message per contact: translation selection, expression
//! evaluation, destination URN choice and template binding.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use regex::Regex;
use switchyard_common::types::{
    locale_for, BroadcastRef, ContactId, ContactStatus, FailedReason, MsgStatus, Urn,
};
use switchyard_common::{Error, Result};
use switchyard_storage::models::{Broadcast, BroadcastBatch, Contact, ContactUrn, NewMsg};
use switchyard_storage::repository::{
    BroadcastRepository, ContactRepository, MsgRepository, OptInRepository, SessionRepository,
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::expr::{self, ExprEnv};
use crate::queue::{self, Queue, Task, DEFAULT_PRIORITY};
use crate::runtime::Runtime;

/// Task type for expanding a broadcast into batches
pub const TYPE_SEND_BROADCAST: &str = "send_broadcast";

/// Task type for rendering one batch of a broadcast
pub const TYPE_SEND_BROADCAST_BATCH: &str = "send_broadcast_batch";

const BATCH_SIZE: usize = 100;

// sends this small skip the batch queue and go straight to handler workers
const SMALL_SEND_LIMIT: usize = 2;

/// Expand a broadcast into batches and queue them, returning how many
/// batches were emitted
pub async fn create_broadcast_batches(rt: &Runtime, bcast: &Broadcast) -> Result<usize> {
    let oa = rt.assets.get(&rt.db, bcast.org_id).await?;
    let pool = rt.db.pool().clone();
    let contacts_repo = ContactRepository::new(pool.clone());

    // recipient set in insertion order, starting with the explicit contacts
    let mut recipients: Vec<ContactId> = vec![];
    let mut seen: HashSet<ContactId> = HashSet::new();
    extend_unique(&mut recipients, &mut seen, bcast.contact_ids.iter().copied());

    // group members, static from the junction table, smart via search
    let mut static_groups = vec![];
    for group_id in &bcast.group_ids {
        match oa.group_by_id(*group_id) {
            Some(group) if group.is_smart() => {
                let query = group.query.clone().unwrap_or_default();
                let ids = rt
                    .search
                    .contact_ids_for_query(bcast.org_id, &query, Some(ContactStatus::Active))
                    .await?;
                extend_unique(&mut recipients, &mut seen, ids.into_iter());
            }
            _ => static_groups.push(*group_id),
        }
    }
    if !static_groups.is_empty() {
        let ids = contacts_repo.ids_for_groups(&static_groups).await?;
        extend_unique(&mut recipients, &mut seen, ids.into_iter());
    }

    // search query recipients
    if let Some(query) = bcast.query.as_deref().filter(|q| !q.is_empty()) {
        let ids = rt
            .search
            .contact_ids_for_query(bcast.org_id, query, Some(ContactStatus::Active))
            .await?;
        extend_unique(&mut recipients, &mut seen, ids.into_iter());
    }

    // raw URNs resolve to contacts, created on first use
    let urn_map = contacts_repo
        .get_or_create_by_urns(bcast.org_id, &bcast.urns)
        .await?;
    let urn_contacts: HashMap<ContactId, Urn> =
        urn_map.into_iter().map(|(urn, id)| (id, urn)).collect();

    apply_exclusions(rt, bcast, &mut recipients).await?;

    // URN-forced recipients are withheld from normal batches, they get
    // their override in the final batch
    recipients.retain(|id| !urn_contacts.contains_key(id));

    let total = recipients.len() + urn_contacts.len();
    let q = if total <= SMALL_SEND_LIMIT {
        Queue::Handler
    } else {
        Queue::Batch
    };

    let plans = batch_plan(&recipients, &urn_contacts);
    let count = plans.len();

    let mut conn = rt.kv.conn().await?;
    for (contact_ids, is_last) in plans {
        let mut batch = bcast.create_batch(contact_ids, is_last);
        if is_last {
            batch.urns = urn_contacts.clone();
        }

        let task = Task::new(TYPE_SEND_BROADCAST_BATCH, bcast.org_id, &batch)?;
        queue::push(&mut conn, q, bcast.org_id, DEFAULT_PRIORITY, &task).await?;
    }

    Ok(count)
}

fn extend_unique(
    recipients: &mut Vec<ContactId>,
    seen: &mut HashSet<ContactId>,
    ids: impl Iterator<Item = ContactId>,
) {
    for id in ids {
        if seen.insert(id) {
            recipients.push(id);
        }
    }
}

async fn apply_exclusions(
    rt: &Runtime,
    bcast: &Broadcast,
    recipients: &mut Vec<ContactId>,
) -> Result<()> {
    let pool = rt.db.pool().clone();
    let excl = &bcast.exclusions;

    if excl.non_active && !recipients.is_empty() {
        let contacts = ContactRepository::new(pool.clone())
            .load_by_ids(bcast.org_id, recipients)
            .await?;
        let active: HashSet<ContactId> = contacts
            .iter()
            .filter(|c| c.status == "A")
            .map(|c| c.id)
            .collect();
        recipients.retain(|id| active.contains(id));
    }

    if excl.in_a_flow && !recipients.is_empty() {
        let waiting: HashSet<ContactId> = SessionRepository::new(pool.clone())
            .waiting_contact_ids(bcast.org_id)
            .await?
            .into_iter()
            .collect();
        recipients.retain(|id| !waiting.contains(id));
    }

    if excl.started_previously && !recipients.is_empty() {
        if let Some(parent_id) = bcast.parent_id {
            let prior: HashSet<ContactId> = MsgRepository::new(pool.clone())
                .contact_ids_for_broadcast(parent_id)
                .await?
                .into_iter()
                .collect();
            recipients.retain(|id| !prior.contains(id));
        }
    }

    if excl.unsubscribed && !recipients.is_empty() {
        if let Some(optin_id) = bcast.optin_id {
            let opted_out: HashSet<ContactId> = OptInRepository::new(pool)
                .opted_out_contact_ids(bcast.org_id, optin_id)
                .await?
                .into_iter()
                .collect();
            recipients.retain(|id| !opted_out.contains(id));
        }
    }

    Ok(())
}

/// Slice recipients into batches. Always emits at least one batch so the
/// last-batch bookkeeping runs even for an empty broadcast; URN-forced
/// contacts land only in the final batch.
fn batch_plan(
    recipients: &[ContactId],
    urn_contacts: &HashMap<ContactId, Urn>,
) -> Vec<(Vec<ContactId>, bool)> {
    let mut chunks: Vec<Vec<ContactId>> = recipients
        .chunks(BATCH_SIZE)
        .map(|chunk| chunk.to_vec())
        .collect();

    if chunks.is_empty() {
        chunks.push(vec![]);
    }

    if !urn_contacts.is_empty() {
        let mut urn_ids: Vec<ContactId> = urn_contacts.keys().copied().collect();
        urn_ids.sort_unstable();

        let fits = chunks
            .last()
            .map(|last| last.len() + urn_ids.len() <= BATCH_SIZE)
            .unwrap_or(false);

        if fits {
            if let Some(last) = chunks.last_mut() {
                last.extend(urn_ids);
            }
        } else {
            chunks.push(urn_ids);
        }
    }

    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, contact_ids)| (contact_ids, i == count - 1))
        .collect()
}

/// Render and persist one batch's messages. The last batch of a persisted
/// broadcast marks it sent whether or not rendering succeeded; the batch
/// task is what gets retried.
pub async fn send_broadcast_batch(rt: &Runtime, batch: &BroadcastBatch) -> Result<usize> {
    let oa = rt.assets.get(&rt.db, batch.org_id).await?;

    let result = create_messages(rt, &oa, batch).await;

    if batch.is_last {
        if let BroadcastRef::Persisted(id) = batch.broadcast_id {
            let repo = BroadcastRepository::new(rt.db.pool().clone());
            if let Err(e) = repo.mark_sent(id).await {
                error!(broadcast_id = id, error = %e, "error marking broadcast as sent");
            }
        }
    }

    result
}

/// Create the outbound messages for a batch. A single contact failing to
/// render is logged and skipped; storage errors fail the batch.
pub async fn create_messages(
    rt: &Runtime,
    oa: &OrgAssets,
    batch: &BroadcastBatch,
) -> Result<usize> {
    let pool = rt.db.pool().clone();
    let contacts_repo = ContactRepository::new(pool.clone());

    let contacts = contacts_repo
        .load_by_ids(batch.org_id, &batch.contact_ids)
        .await?;

    let urn_rows = contacts_repo
        .urns_for_contacts(batch.org_id, &batch.contact_ids)
        .await?;
    let mut urns_by_contact: HashMap<ContactId, Vec<ContactUrn>> = HashMap::new();
    for row in urn_rows {
        if let Some(contact_id) = row.contact_id {
            urns_by_contact.entry(contact_id).or_default().push(row);
        }
    }

    let mut msgs = Vec::with_capacity(contacts.len());
    for contact in &contacts {
        let contact_urns = urns_by_contact.remove(&contact.id).unwrap_or_default();

        match build_message(oa, batch, contact, &contact_urns) {
            Ok(msg) => msgs.push(msg),
            Err(e) => {
                warn!(contact_id = contact.id, error = %e, "error rendering message for contact, skipping");
            }
        }
    }

    let inserted = MsgRepository::new(pool).insert_batch(&msgs).await?;
    Ok(inserted as usize)
}

/// Render the outbound message for a single contact in a batch
pub fn build_message(
    oa: &OrgAssets,
    batch: &BroadcastBatch,
    contact: &Contact,
    contact_urns: &[ContactUrn],
) -> Result<NewMsg> {
    let language = choose_language(oa, batch, contact);

    let translation = batch
        .translations
        .get(&language)
        .or_else(|| batch.translations.get(&batch.base_language))
        .ok_or_else(|| {
            Error::Validation(format!(
                "broadcast has no translation for base language {}",
                batch.base_language
            ))
        })?;

    // forced URN from the override map wins, else the contact's highest
    // priority URN some channel can send to
    let sendable = oa.sendable_schemes();
    let destination: Option<Urn> = match batch.urns.get(&contact.id) {
        Some(urn) => Some(urn.clone()),
        None => contact_urns
            .iter()
            .filter(|u| sendable.contains(u.scheme.as_str()))
            .find_map(|u| u.as_urn()),
    };

    let urn_country = destination.as_ref().and_then(|u| u.country().map(str::to_string));
    let country = urn_country.or_else(|| oa.country().map(str::to_string));

    let mut locale = Some(locale_for(&language, country.as_deref()));

    // evaluate message content as expressions against the contact when
    // enabled, falling back to the raw template per field on error
    let env = ExprEnv::for_contact(contact, destination.as_ref().map(|u| u.identity()).as_deref());

    let mut text = translation.text.clone();
    let mut attachments = translation.attachments.clone();
    let mut quick_replies = translation.quick_replies.clone();

    if batch.expressions {
        match expr::evaluate_template(&text, &env) {
            Ok(evaluated) => text = evaluated,
            Err(e) => warn!(contact_id = contact.id, error = %e, "error evaluating message text"),
        }

        let (evaluated, failures) = expr::evaluate_all(&attachments, &env);
        if failures > 0 {
            warn!(contact_id = contact.id, failures, "error evaluating attachments");
        }
        attachments = evaluated;

        let (evaluated, failures) = expr::evaluate_all(&quick_replies, &env);
        if failures > 0 {
            warn!(contact_id = contact.id, failures, "error evaluating quick replies");
        }
        quick_replies = evaluated;
    }

    // a template send replaces the body with the rendered template and
    // takes its locale from the chosen template translation
    let mut is_template = false;
    if let Some(template_id) = batch.template_id {
        if let Some(tt) = oa.template_translation(template_id, &language, country.as_deref()) {
            let variables = if batch.expressions {
                expr::evaluate_all(&batch.template_variables, &env).0
            } else {
                batch.template_variables.clone()
            };

            text = render_template(&tt.content, &variables);
            locale = Some(locale_for(&tt.language, tt.country.as_deref()));
            is_template = true;
        }
    }

    let (status, failed_reason) = if destination.is_none() {
        // auditable rather than silently dropped
        (MsgStatus::Failed, Some(FailedReason::NoDestination))
    } else if is_template {
        (MsgStatus::Initializing, None)
    } else {
        (MsgStatus::Queued, None)
    };

    Ok(NewMsg {
        uuid: Uuid::new_v4(),
        org_id: batch.org_id,
        contact_id: contact.id,
        urn: destination.map(|u| u.identity()),
        text,
        attachments,
        quick_replies,
        locale,
        status: status.code().to_string(),
        failed_reason: failed_reason.map(|r| r.code().to_string()),
        broadcast_id: batch.broadcast_id.id(),
        optin_id: batch.optin_id,
        template_id: batch.template_id,
        template_variables: batch.template_variables.clone(),
        created_on: Utc::now(),
    })
}

/// Choose the language to render in: the contact's preferred language when
/// it is both configured for the org and translated, otherwise the base
/// language
fn choose_language(oa: &OrgAssets, batch: &BroadcastBatch, contact: &Contact) -> String {
    if let Some(contact_lang) = contact.language.as_deref() {
        let configured = oa.languages().iter().any(|l| l == contact_lang);
        if configured && batch.translations.contains_key(contact_lang) {
            return contact_lang.to_string();
        }
    }

    batch.base_language.clone()
}

/// Bind positional variables into a template body, `{{1}}` is the first
/// variable
fn render_template(content: &str, variables: &[String]) -> String {
    let re = Regex::new(r"\{\{(\d+)\}\}").expect("valid regex");
    re.replace_all(content, |caps: &regex::Captures| {
        match caps[1].parse::<usize>() {
            Ok(n) if n >= 1 => variables.get(n - 1).cloned().unwrap_or_default(),
            _ => String::new(),
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use switchyard_common::types::BroadcastRef;
    use switchyard_storage::models::{
        Channel, Org, Template, TemplateTranslation, TranslationContent,
    };

    fn test_assets() -> OrgAssets {
        OrgAssets::new(
            Org {
                id: 1,
                name: "Nyaruka".to_string(),
                languages: vec!["eng".to_string(), "fra".to_string()],
                country: Some("EC".to_string()),
                created_on: Utc::now(),
            },
            vec![
                Channel {
                    id: 10,
                    uuid: Uuid::new_v4(),
                    org_id: 1,
                    name: "Vonage".to_string(),
                    schemes: vec!["tel".to_string()],
                },
                Channel {
                    id: 11,
                    uuid: Uuid::new_v4(),
                    org_id: 1,
                    name: "Facebook".to_string(),
                    schemes: vec!["facebook".to_string()],
                },
            ],
            vec![],
            vec![Template {
                id: 7,
                org_id: 1,
                name: "revive_issue".to_string(),
            }],
            vec![TemplateTranslation {
                id: 1,
                template_id: 7,
                channel_id: Some(11),
                language: "eng".to_string(),
                country: Some("US".to_string()),
                content: "Hi {{1}}, are you still experiencing problems with {{2}}?".to_string(),
                variable_count: 2,
            }],
            vec![],
            vec![],
        )
    }

    fn contact(id: ContactId, language: Option<&str>) -> Contact {
        Contact {
            id,
            uuid: Uuid::new_v4(),
            org_id: 1,
            name: Some("Felix".to_string()),
            language: language.map(str::to_string),
            status: "A".to_string(),
            created_on: Utc::now(),
            modified_on: Utc::now(),
            last_seen_on: None,
        }
    }

    fn tel_urn(contact_id: ContactId, path: &str) -> ContactUrn {
        ContactUrn {
            id: contact_id as i64,
            org_id: 1,
            contact_id: Some(contact_id),
            scheme: "tel".to_string(),
            path: path.to_string(),
            identity: format!("tel:{}", path),
            priority: 1000,
        }
    }

    fn batch(translations: &[(&str, &str)], base: &str, expressions: bool) -> BroadcastBatch {
        let translations = translations
            .iter()
            .map(|(lang, text)| (lang.to_string(), TranslationContent::text(*text)))
            .collect();

        BroadcastBatch {
            broadcast_id: BroadcastRef::Persisted(12),
            org_id: 1,
            translations,
            base_language: base.to_string(),
            expressions,
            optin_id: None,
            template_id: None,
            template_variables: vec![],
            contact_ids: vec![],
            is_last: false,
            urns: HashMap::new(),
        }
    }

    #[test]
    fn test_no_expressions_leaves_text_raw() {
        let oa = test_assets();
        let batch = batch(&[("eng", "Hi @contact")], "eng", false);
        let contact = contact(1, None);
        let urns = [tel_urn(1, "+593979000000")];

        let msg = build_message(&oa, &batch, &contact, &urns).unwrap();
        assert_eq!(msg.text, "Hi @contact");
        assert_eq!(msg.locale.as_deref(), Some("eng-EC"));
        assert_eq!(msg.urn.as_deref(), Some("tel:+593979000000"));
        assert_eq!(msg.status, "Q");
    }

    #[test]
    fn test_language_fallback_to_base() {
        let oa = test_assets();
        let b = batch(
            &[("eng", "Hello @contact.name"), ("spa", "Hola @contact.name")],
            "eng",
            true,
        );

        // no contact language uses base
        let c = contact(1, None);
        let msg = build_message(&oa, &b, &c, &[tel_urn(1, "+593979000001")]).unwrap();
        assert_eq!(msg.text, "Hello Felix");
        assert_eq!(msg.locale.as_deref(), Some("eng-EC"));

        // a contact language that isn't an org language is ignored, even
        // with a translation present
        let c = contact(2, Some("spa"));
        let msg = build_message(&oa, &b, &c, &[tel_urn(2, "+593979000002")]).unwrap();
        assert_eq!(msg.text, "Hello Felix");
        assert_eq!(msg.locale.as_deref(), Some("eng-EC"));
    }

    #[test]
    fn test_contact_language_honored() {
        let oa = test_assets();
        let mut b = batch(
            &[("eng", "Hello @contact.name"), ("fra", "Bonjour @contact.name")],
            "eng",
            true,
        );
        if let Some(t) = b.translations.get_mut("fra") {
            t.attachments = vec!["audio/mp3:http://test.fr.mp3".to_string()];
            t.quick_replies = vec!["oui".to_string(), "no".to_string()];
        }

        let c = contact(3, Some("fra"));
        let msg = build_message(&oa, &b, &c, &[tel_urn(3, "+593979000003")]).unwrap();
        assert_eq!(msg.text, "Bonjour Felix");
        assert_eq!(msg.locale.as_deref(), Some("fra-EC"));
        assert_eq!(msg.attachments, vec!["audio/mp3:http://test.fr.mp3"]);
        assert_eq!(msg.quick_replies, vec!["oui", "no"]);
    }

    #[test]
    fn test_template_send() {
        let oa = test_assets();
        let mut b = batch(&[("eng", "Hi @contact")], "eng", true);
        b.template_id = Some(7);
        b.template_variables = vec!["@contact.name".to_string(), "mice".to_string()];

        let c = contact(4, Some("eng"));
        let mut urn = tel_urn(4, "1000000000002");
        urn.scheme = "facebook".to_string();
        urn.identity = "facebook:1000000000002".to_string();

        let msg = build_message(&oa, &b, &c, &[urn]).unwrap();
        assert_eq!(
            msg.text,
            "Hi Felix, are you still experiencing problems with mice?"
        );
        // template sends take their locale from the template translation
        assert_eq!(msg.locale.as_deref(), Some("eng-US"));
        assert_eq!(msg.status, "I");
        assert_eq!(msg.template_id, Some(7));
    }

    #[test]
    fn test_urn_override_wins() {
        let oa = test_assets();
        let mut b = batch(&[("eng", "Hi there")], "eng", false);
        b.urns
            .insert(5, Urn::parse("tel:+593979012345").unwrap());

        let c = contact(5, None);
        // the contact's own URN is ignored in favor of the override
        let msg = build_message(&oa, &b, &c, &[tel_urn(5, "+593979099999")]).unwrap();
        assert_eq!(msg.urn.as_deref(), Some("tel:+593979012345"));
    }

    #[test]
    fn test_no_destination_fails_message() {
        let oa = test_assets();
        let b = batch(&[("eng", "Hi there")], "eng", false);

        // no URNs at all
        let c = contact(6, None);
        let msg = build_message(&oa, &b, &c, &[]).unwrap();
        assert_eq!(msg.status, "F");
        assert_eq!(msg.failed_reason.as_deref(), Some("D"));
        assert_eq!(msg.urn, None);

        // a URN no channel can send to
        let mut urn = tel_urn(6, "bob");
        urn.scheme = "mailto".to_string();
        urn.identity = "mailto:bob".to_string();
        let msg = build_message(&oa, &b, &c, &[urn]).unwrap();
        assert_eq!(msg.status, "F");
    }

    #[test]
    fn test_missing_base_translation_errors() {
        let oa = test_assets();
        let b = batch(&[("fra", "Bonjour")], "eng", false);
        let c = contact(7, None);

        let err = build_message(&oa, &b, &c, &[tel_urn(7, "+593979000007")]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_render_template() {
        assert_eq!(
            render_template("Hi {{1}}, problems with {{2}}?", &["Felix".to_string(), "mice".to_string()]),
            "Hi Felix, problems with mice?"
        );
        // missing variables render empty
        assert_eq!(render_template("Hi {{1}}{{3}}", &["Bob".to_string()]), "Hi Bob");
        // zero is not a valid position
        assert_eq!(render_template("{{0}}x", &["Bob".to_string()]), "x");
    }

    #[test]
    fn test_batch_plan_properties() {
        let recipients: Vec<ContactId> = (1..=250).collect();
        let mut urn_contacts = HashMap::new();
        urn_contacts.insert(900, Urn::parse("tel:+593979012345").unwrap());
        urn_contacts.insert(901, Urn::parse("tel:+593979012346").unwrap());

        let plans = batch_plan(&recipients, &urn_contacts);

        // only the final batch is marked last
        assert_eq!(plans.iter().filter(|(_, last)| *last).count(), 1);
        assert!(plans.last().map(|(_, last)| *last).unwrap_or(false));

        // union of all batches is exactly recipients plus URN contacts,
        // each appearing once
        let mut all: Vec<ContactId> = plans.iter().flat_map(|(ids, _)| ids.clone()).collect();
        all.sort_unstable();
        let mut expected: Vec<ContactId> = (1..=250).chain([900, 901]).collect();
        expected.sort_unstable();
        assert_eq!(all, expected);

        // URN contacts only appear in the last batch
        for (ids, last) in &plans {
            if !last {
                assert!(!ids.contains(&900) && !ids.contains(&901));
                assert!(ids.len() <= BATCH_SIZE);
            }
        }
    }

    #[test]
    fn test_batch_plan_empty_broadcast_still_emits_last() {
        let plans = batch_plan(&[], &HashMap::new());
        assert_eq!(plans.len(), 1);
        assert!(plans[0].0.is_empty());
        assert!(plans[0].1);
    }

    #[test]
    fn test_batch_plan_urns_spill_to_own_batch() {
        let recipients: Vec<ContactId> = (1..=100).collect();
        let mut urn_contacts = HashMap::new();
        urn_contacts.insert(900, Urn::parse("tel:+593979012345").unwrap());

        let plans = batch_plan(&recipients, &urn_contacts);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].0.len(), 100);
        assert_eq!(plans[1].0, vec![900]);
        assert!(plans[1].1);
    }
}
