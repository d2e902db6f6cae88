//! Ticket lifecycle and provider integration
//!
//! Tickets live in the database; each belongs to a ticketer whose `type`
//! tag selects a provider adapter from the registry. External sync happens
//! before any DB mutation on close/reopen so a provider failure never
//! leaves the ticket state inconsistent, and every provider call's HTTP
//! trace is persisted whether it succeeded or not.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use switchyard_common::types::{TicketEventType, TicketStatus, TicketerId, UserId};
use switchyard_common::{Error, Result};
use switchyard_storage::models::{Contact, NewTicket, NewTicketEvent, Ticket, Ticketer};
use switchyard_storage::repository::{HttpLogRepository, TicketRepository};
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::http::{HttpClient, HttpLogger};
use crate::runtime::Runtime;

/// The capability set a ticketer adapter must supply. All calls record
/// their HTTP traces through the passed logger.
#[async_trait]
pub trait TicketProvider: Send + Sync + std::fmt::Debug {
    /// Open a ticket with the external provider, returning its external ID
    /// if it assigns one. Only flow-driven ticketers support this.
    async fn open(
        &self,
        contact: &Contact,
        subject: &str,
        body: &str,
        logger: &mut HttpLogger,
    ) -> Result<Option<String>> {
        let _ = (contact, subject, body, logger);
        Err(Error::Provider(
            "provider does not support opening tickets".to_string(),
        ))
    }

    /// Forward an incoming contact message to the external conversation
    async fn forward(
        &self,
        ticket: &Ticket,
        msg_uuid: Uuid,
        text: &str,
        attachments: &[String],
        logger: &mut HttpLogger,
    ) -> Result<()>;

    /// Close the given tickets with the external provider
    async fn close(&self, tickets: &[Ticket], logger: &mut HttpLogger) -> Result<()>;

    /// Reopen the given tickets with the external provider
    async fn reopen(&self, tickets: &[Ticket], logger: &mut HttpLogger) -> Result<()>;
}

/// Builds a provider from a ticketer's config
pub type ProviderFactory =
    Arc<dyn Fn(&HttpClient, &Ticketer) -> Result<Box<dyn TicketProvider>> + Send + Sync>;

/// Registry of provider factories keyed by ticketer type tag. Populated at
/// startup and passed to the runtime; deliberately not process-global
/// state.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a ticketer type
    pub fn register(&mut self, ticketer_type: impl Into<String>, factory: ProviderFactory) {
        self.factories.insert(ticketer_type.into(), factory);
    }

    /// Build the provider for the given ticketer
    pub fn build(&self, http: &HttpClient, ticketer: &Ticketer) -> Result<Box<dyn TicketProvider>> {
        let factory = self
            .factories
            .get(&ticketer.ticketer_type)
            .ok_or_else(|| Error::UnknownProvider(ticketer.ticketer_type.clone()))?;

        factory(http, ticketer)
    }
}

/// The work a close or reopen will do: which tickets actually transition,
/// their audit events, and the per-ticketer grouping for external sync
pub struct TransitionPlan {
    pub ids: Vec<switchyard_common::types::TicketId>,
    pub events: Vec<NewTicketEvent>,
    pub by_ticketer: HashMap<TicketerId, Vec<Ticket>>,
}

impl TransitionPlan {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Work out which of the given tickets transition to the target status.
/// Tickets already there are silently skipped, which is what makes
/// close/reopen idempotent.
pub fn transition_plan(
    tickets: &[Ticket],
    target: TicketStatus,
    user_id: Option<UserId>,
) -> TransitionPlan {
    let event_type = match target {
        TicketStatus::Closed => TicketEventType::Closed,
        TicketStatus::Open => TicketEventType::Reopened,
    };

    let mut plan = TransitionPlan {
        ids: vec![],
        events: vec![],
        by_ticketer: HashMap::new(),
    };

    for ticket in tickets {
        if ticket.status == target.code() {
            continue;
        }

        plan.ids.push(ticket.id);
        plan.events.push(NewTicketEvent {
            org_id: ticket.org_id,
            ticket_id: ticket.id,
            contact_id: ticket.contact_id,
            event_type: event_type.code().to_string(),
            created_by_id: user_id,
            note: None,
        });
        plan.by_ticketer
            .entry(ticket.ticketer_id)
            .or_default()
            .push(ticket.clone());
    }

    plan
}

/// Close the given tickets, optionally syncing the close to their external
/// providers first. Already-closed tickets are skipped. Returns how many
/// transitioned.
pub async fn close_tickets(
    rt: &Runtime,
    oa: &OrgAssets,
    user_id: Option<UserId>,
    tickets: &[Ticket],
    externally: bool,
) -> Result<usize> {
    let plan = transition_plan(tickets, TicketStatus::Closed, user_id);
    if plan.is_empty() {
        return Ok(0);
    }

    if externally {
        sync_externally(rt, oa, &plan, TicketStatus::Closed).await?;
    }

    let repo = TicketRepository::new(rt.db.pool().clone());
    repo.close(&plan.ids, Utc::now(), &plan.events).await?;

    Ok(plan.ids.len())
}

/// Reopen the given tickets, the mirror of [`close_tickets`]
pub async fn reopen_tickets(
    rt: &Runtime,
    oa: &OrgAssets,
    user_id: Option<UserId>,
    tickets: &[Ticket],
    externally: bool,
) -> Result<usize> {
    let plan = transition_plan(tickets, TicketStatus::Open, user_id);
    if plan.is_empty() {
        return Ok(0);
    }

    if externally {
        sync_externally(rt, oa, &plan, TicketStatus::Open).await?;
    }

    let repo = TicketRepository::new(rt.db.pool().clone());
    repo.reopen(&plan.ids, Utc::now(), &plan.events).await?;

    Ok(plan.ids.len())
}

/// Run the provider-side transition for every ticketer in the plan. The
/// traces are persisted even when a provider fails, and a failure aborts
/// the whole operation before any DB mutation.
async fn sync_externally(
    rt: &Runtime,
    oa: &OrgAssets,
    plan: &TransitionPlan,
    target: TicketStatus,
) -> Result<()> {
    let logs_repo = HttpLogRepository::new(rt.db.pool().clone());

    for (ticketer_id, group) in &plan.by_ticketer {
        let ticketer = match oa.ticketer_by_id(*ticketer_id) {
            Some(t) => t,
            None => continue,
        };

        let provider = rt.providers.build(&rt.http, ticketer)?;
        let mut logger = HttpLogger::new();

        let result = match target {
            TicketStatus::Closed => provider.close(group, &mut logger).await,
            TicketStatus::Open => provider.reopen(group, &mut logger).await,
        };

        if !logger.is_empty() {
            logs_repo
                .insert_all(&logger.as_logs(oa.org_id(), Some(*ticketer_id)))
                .await?;
        }

        result?;
    }

    Ok(())
}

/// Forward an incoming message from a contact to this ticket's provider.
/// The ticket row itself is not mutated; the HTTP trace is persisted
/// regardless of the outcome.
pub async fn forward_incoming(
    rt: &Runtime,
    oa: &OrgAssets,
    ticket: &Ticket,
    msg_uuid: Uuid,
    text: &str,
    attachments: &[String],
) -> Result<()> {
    let ticketer = oa
        .ticketer_by_id(ticket.ticketer_id)
        .ok_or_else(|| Error::NotFound(format!("ticketer {}", ticket.ticketer_id)))?;

    let provider = rt.providers.build(&rt.http, ticketer)?;
    let mut logger = HttpLogger::new();

    let result = provider
        .forward(ticket, msg_uuid, text, attachments, &mut logger)
        .await;

    if !logger.is_empty() {
        let logs_repo = HttpLogRepository::new(rt.db.pool().clone());
        logs_repo
            .insert_all(&logger.as_logs(oa.org_id(), Some(ticket.ticketer_id)))
            .await?;
    }

    result
}

/// Open a ticket on the given ticketer for a contact: external open first,
/// then the DB insert and its Opened audit event
pub async fn open_ticket(
    rt: &Runtime,
    oa: &OrgAssets,
    ticketer_id: TicketerId,
    user_id: Option<UserId>,
    contact: &Contact,
    subject: &str,
    body: &str,
) -> Result<Ticket> {
    let ticketer = oa
        .ticketer_by_id(ticketer_id)
        .ok_or_else(|| Error::NotFound(format!("ticketer {}", ticketer_id)))?;

    let provider = rt.providers.build(&rt.http, ticketer)?;
    let mut logger = HttpLogger::new();

    let opened = provider.open(contact, subject, body, &mut logger).await;

    if !logger.is_empty() {
        let logs_repo = HttpLogRepository::new(rt.db.pool().clone());
        logs_repo
            .insert_all(&logger.as_logs(oa.org_id(), Some(ticketer_id)))
            .await?;
    }

    let external_id = opened?;

    let repo = TicketRepository::new(rt.db.pool().clone());
    let mut inserted = repo
        .insert(&[NewTicket {
            uuid: Uuid::new_v4(),
            org_id: oa.org_id(),
            contact_id: contact.id,
            ticketer_id,
            external_id,
            subject: subject.to_string(),
            body: body.to_string(),
            config: serde_json::json!({}),
        }])
        .await?;

    let ticket = inserted
        .pop()
        .ok_or_else(|| Error::NotFound("inserted ticket".to_string()))?;

    repo.insert_events(&[NewTicketEvent {
        org_id: ticket.org_id,
        ticket_id: ticket.id,
        contact_id: ticket.contact_id,
        event_type: TicketEventType::Opened.code().to_string(),
        created_by_id: user_id,
        note: None,
    }])
    .await?;

    Ok(ticket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use switchyard_common::config::HttpConfig;

    fn ticket(id: i32, ticketer_id: i32, status: &str) -> Ticket {
        let now = Utc::now();
        Ticket {
            id,
            uuid: Uuid::new_v4(),
            org_id: 1,
            contact_id: 100 + id,
            ticketer_id,
            external_id: Some(format!("EX{}", id)),
            status: status.to_string(),
            subject: "New Ticket".to_string(),
            body: "Where are my cookies?".to_string(),
            config: serde_json::json!({}),
            opened_on: now,
            modified_on: now,
            closed_on: None,
            last_activity_on: now,
        }
    }

    fn ticketer(ticketer_type: &str) -> Ticketer {
        Ticketer {
            id: 3,
            uuid: Uuid::new_v4(),
            org_id: 1,
            ticketer_type: ticketer_type.to_string(),
            name: "Support".to_string(),
            config: serde_json::json!({"subdomain": "acme"}),
        }
    }

    #[derive(Debug)]
    struct NullProvider;

    #[async_trait]
    impl TicketProvider for NullProvider {
        async fn forward(
            &self,
            _ticket: &Ticket,
            _msg_uuid: Uuid,
            _text: &str,
            _attachments: &[String],
            _logger: &mut HttpLogger,
        ) -> Result<()> {
            Ok(())
        }

        async fn close(&self, _tickets: &[Ticket], _logger: &mut HttpLogger) -> Result<()> {
            Ok(())
        }

        async fn reopen(&self, _tickets: &[Ticket], _logger: &mut HttpLogger) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_transition_plan_skips_already_there() {
        let tickets = vec![ticket(1, 3, "O"), ticket(2, 3, "C"), ticket(3, 4, "O")];

        let plan = transition_plan(&tickets, TicketStatus::Closed, Some(7));
        assert_eq!(plan.ids, vec![1, 3]);
        assert_eq!(plan.events.len(), 2);
        assert!(plan.events.iter().all(|e| e.event_type == "C"));
        assert!(plan.events.iter().all(|e| e.created_by_id == Some(7)));
        assert_eq!(plan.by_ticketer.len(), 2);
        assert_eq!(plan.by_ticketer[&3].len(), 1);
        assert_eq!(plan.by_ticketer[&4].len(), 1);
    }

    #[test]
    fn test_transition_plan_idempotent() {
        let mut tickets = vec![ticket(1, 3, "O"), ticket(2, 3, "O")];

        let plan = transition_plan(&tickets, TicketStatus::Closed, None);
        assert_eq!(plan.ids.len(), 2);

        // after the first close, a second plan is empty
        for t in &mut tickets {
            t.status = "C".to_string();
        }
        let plan = transition_plan(&tickets, TicketStatus::Closed, None);
        assert!(plan.is_empty());

        // and reopening them all transitions back
        let plan = transition_plan(&tickets, TicketStatus::Open, None);
        assert_eq!(plan.ids.len(), 2);
        assert!(plan.events.iter().all(|e| e.event_type == "R"));
    }

    #[tokio::test]
    async fn test_registry() {
        let http = HttpClient::new(&HttpConfig::default()).unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register(
            "null",
            Arc::new(|_http, _ticketer| Ok(Box::new(NullProvider) as Box<dyn TicketProvider>)),
        );

        // registered type builds
        let provider = registry.build(&http, &ticketer("null")).unwrap();
        let mut logger = HttpLogger::new();
        provider.close(&[], &mut logger).await.unwrap();

        // open is optional and errors by default
        let contact = Contact {
            id: 1,
            uuid: Uuid::new_v4(),
            org_id: 1,
            name: None,
            language: None,
            status: "A".to_string(),
            created_on: Utc::now(),
            modified_on: Utc::now(),
            last_seen_on: None,
        };
        let err = provider
            .open(&contact, "subject", "body", &mut logger)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));

        // unknown type errors
        let err = registry.build(&http, &ticketer("zammad")).unwrap_err();
        assert!(matches!(err, Error::UnknownProvider(_)));
    }
}
