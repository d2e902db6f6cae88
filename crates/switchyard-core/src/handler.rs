//! Per-contact event handling
//!
//! Events for one contact must be handled in the order they were queued
//! while unrelated contacts proceed in parallel. That's done with a
//! two-level queue: each event is pushed onto a per-contact list, then a
//! wake-up token goes onto the global handler queue. Workers pop wake-ups,
//! take the contact's lock and drain the contact list head-first.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use switchyard_common::types::{ContactId, OrgId, SessionId};
use switchyard_common::{Error, Result};
use switchyard_storage::repository::{SessionRepository, TicketRepository};
use tracing::{error, warn};
use uuid::Uuid;

use crate::lock::Lock;
use crate::queue::{self, Queue, Task, DEFAULT_PRIORITY};
use crate::runtime::Runtime;
use crate::tickets;

/// Task type for the wake-up token on the handler queue
pub const TYPE_HANDLE_CONTACT_EVENT: &str = "handle_contact_event";

/// Per-contact event types
pub const TYPE_MSG_EVENT: &str = "msg_event";
pub const TYPE_TIMEOUT_EVENT: &str = "timeout_event";
pub const TYPE_EXPIRATION_EVENT: &str = "expiration_event";

const CONTACT_LOCK_TTL: Duration = Duration::from_secs(10 * 60);

/// Deadline for handling a single event
const EVENT_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// Attempts before an event moves to the dead-letter list
const MAX_ERRORS: i32 = 3;

/// The wake-up task carried on the global handler queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleContactEventTask {
    pub contact_id: ContactId,
}

/// The envelope stored on the per-contact list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactEventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub task: serde_json::Value,
    pub queued_on: DateTime<Utc>,
    #[serde(default)]
    pub error_count: i32,
}

/// An inbound message from a contact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgEvent {
    pub msg_id: i64,
    pub msg_uuid: Uuid,
    pub urn: Option<String>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// A session wait hitting its timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutEvent {
    pub session_id: SessionId,
    pub time: DateTime<Utc>,
}

/// A session wait expiring outright
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirationEvent {
    pub session_id: SessionId,
    pub time: DateTime<Utc>,
}

fn contact_queue_key(org_id: OrgId, contact_id: ContactId) -> String {
    format!("c:{}:{}", org_id, contact_id)
}

fn dead_letter_key(org_id: OrgId, contact_id: ContactId) -> String {
    format!("c:{}:{}:dead", org_id, contact_id)
}

fn contact_lock_key(org_id: OrgId, contact_id: ContactId) -> String {
    format!("lock:c:{}:{}", org_id, contact_id)
}

/// Queue an event for a contact: the envelope goes on the contact's list
/// and a wake-up token on the global handler queue
pub async fn queue_contact_event(
    conn: &mut MultiplexedConnection,
    org_id: OrgId,
    contact_id: ContactId,
    event_type: &str,
    payload: &impl Serialize,
) -> Result<()> {
    push_contact_event(conn, org_id, contact_id, event_type, serde_json::to_value(payload)?, false, 0)
        .await
}

async fn push_contact_event(
    conn: &mut MultiplexedConnection,
    org_id: OrgId,
    contact_id: ContactId,
    event_type: &str,
    payload: serde_json::Value,
    front: bool,
    error_count: i32,
) -> Result<()> {
    let envelope = ContactEventEnvelope {
        event_type: event_type.to_string(),
        task: payload,
        queued_on: Utc::now(),
        error_count,
    };
    let encoded = serde_json::to_string(&envelope)?;

    let cmd = if front { "LPUSH" } else { "RPUSH" };
    let _: i64 = redis::cmd(cmd)
        .arg(contact_queue_key(org_id, contact_id))
        .arg(&encoded)
        .query_async(conn)
        .await?;

    queue_wakeup(conn, org_id, contact_id).await
}

/// Push a wake-up token for the contact onto the global handler queue
pub async fn queue_wakeup(
    conn: &mut MultiplexedConnection,
    org_id: OrgId,
    contact_id: ContactId,
) -> Result<()> {
    let task = Task::new(
        TYPE_HANDLE_CONTACT_EVENT,
        org_id,
        &HandleContactEventTask { contact_id },
    )?;
    queue::push(conn, Queue::Handler, org_id, DEFAULT_PRIORITY, &task).await
}

/// Handle a wake-up for a contact: take the contact's lock and drain their
/// event list in order. Runs as the `handle_contact_event` task handler.
pub async fn handle_contact_event(rt: &Runtime, org_id: OrgId, contact_id: ContactId) -> Result<()> {
    let mut conn = rt.kv.conn().await?;

    let lock = Lock::new(contact_lock_key(org_id, contact_id), CONTACT_LOCK_TTL);
    let token = match lock.grab(&mut conn, 3).await? {
        Some(token) => token,
        None => {
            // another worker is on this contact, hand the wake-up back
            // after a short randomised delay
            let wait = { rand::thread_rng().gen_range(100..1000) };
            tokio::time::sleep(Duration::from_millis(wait)).await;
            queue_wakeup(&mut conn, org_id, contact_id).await?;
            return Ok(());
        }
    };

    let started = Instant::now();
    let result = drain_contact_events(rt, &mut conn, org_id, contact_id, started).await;

    lock.release(&mut conn, &token).await?;
    result
}

async fn drain_contact_events(
    rt: &Runtime,
    conn: &mut MultiplexedConnection,
    org_id: OrgId,
    contact_id: ContactId,
    started: Instant,
) -> Result<()> {
    let queue_key = contact_queue_key(org_id, contact_id);

    loop {
        // leave the lock's remaining TTL for the next holder rather than
        // risking it expiring mid-event
        if started.elapsed() > CONTACT_LOCK_TTL - Duration::from_secs(60) {
            queue_wakeup(conn, org_id, contact_id).await?;
            return Ok(());
        }

        let payload: Option<String> = redis::cmd("LPOP")
            .arg(&queue_key)
            .query_async(conn)
            .await?;

        // empty means another worker already drained this contact
        let Some(payload) = payload else {
            return Ok(());
        };

        let mut envelope: ContactEventEnvelope = match serde_json::from_str(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(org_id, contact_id, error = %e, "error decoding contact event, discarding");
                continue;
            }
        };

        let outcome =
            tokio::time::timeout(EVENT_DEADLINE, handle_event(rt, org_id, contact_id, &envelope))
                .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(Error::UnknownTaskType(t))) => {
                // permanent, discard rather than retry
                error!(org_id, contact_id, event_type = %t, "unknown contact event type, discarding");
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("handling deadline exceeded".to_string()),
        };

        if let Some(failure) = failure {
            envelope.error_count += 1;

            if envelope.error_count >= MAX_ERRORS {
                warn!(org_id, contact_id, event_type = %envelope.event_type, error = %failure,
                    "contact event errored too many times, dead-lettering");
                let encoded = serde_json::to_string(&envelope)?;
                let _: i64 = redis::cmd("RPUSH")
                    .arg(dead_letter_key(org_id, contact_id))
                    .arg(&encoded)
                    .query_async(conn)
                    .await?;
                continue;
            }

            warn!(org_id, contact_id, event_type = %envelope.event_type, error = %failure,
                errors = envelope.error_count, "error handling contact event, will retry");

            // back on the front so ordering holds, retried on a later
            // wake-up
            let encoded = serde_json::to_string(&envelope)?;
            let _: i64 = redis::cmd("LPUSH")
                .arg(&queue_key)
                .arg(&encoded)
                .query_async(conn)
                .await?;
            queue_wakeup(conn, org_id, contact_id).await?;
            return Ok(());
        }
    }
}

/// Dispatch one event to its handler
async fn handle_event(
    rt: &Runtime,
    org_id: OrgId,
    contact_id: ContactId,
    envelope: &ContactEventEnvelope,
) -> Result<()> {
    match envelope.event_type.as_str() {
        TYPE_MSG_EVENT => {
            let event: MsgEvent = serde_json::from_value(envelope.task.clone())?;
            handle_msg_event(rt, org_id, contact_id, &event).await
        }
        TYPE_TIMEOUT_EVENT => {
            let event: TimeoutEvent = serde_json::from_value(envelope.task.clone())?;
            handle_timeout_event(rt, &event).await
        }
        TYPE_EXPIRATION_EVENT => {
            let event: ExpirationEvent = serde_json::from_value(envelope.task.clone())?;
            handle_expiration_event(rt, &event).await
        }
        other => Err(Error::UnknownTaskType(other.to_string())),
    }
}

/// An inbound message: if the contact has an open ticket, the message is
/// forwarded to the newest one and the ticket's activity clock bumped
async fn handle_msg_event(
    rt: &Runtime,
    org_id: OrgId,
    contact_id: ContactId,
    event: &MsgEvent,
) -> Result<()> {
    let oa = rt.assets.get(&rt.db, org_id).await?;
    let repo = TicketRepository::new(rt.db.pool().clone());

    let open = repo.open_for_contact(org_id, contact_id).await?;
    let Some(ticket) = open.first() else {
        return Ok(());
    };

    tickets::forward_incoming(
        rt,
        &oa,
        ticket,
        event.msg_uuid,
        &event.text,
        &event.attachments,
    )
    .await?;

    repo.update_last_activity(&[ticket.id], Utc::now()).await?;

    Ok(())
}

/// A wait timeout: end the session if it is still waiting on that same
/// timeout. Without a flow runtime in-process the session is interrupted;
/// a stale event for a session that moved on is a no-op.
async fn handle_timeout_event(rt: &Runtime, event: &TimeoutEvent) -> Result<()> {
    let repo = SessionRepository::new(rt.db.pool().clone());

    let Some(session) = repo.get(event.session_id).await? else {
        return Ok(());
    };

    if session.status != "W" || session.timeout_on != Some(event.time) {
        return Ok(());
    }

    repo.end(session.id, "I", Utc::now()).await?;
    Ok(())
}

/// A wait expiring: like a timeout but the session ends as expired
async fn handle_expiration_event(rt: &Runtime, event: &ExpirationEvent) -> Result<()> {
    let repo = SessionRepository::new(rt.db.pool().clone());

    let Some(session) = repo.get(event.session_id).await? else {
        return Ok(());
    };

    if session.status != "W" || session.wait_expires_on != Some(event.time) {
        return Ok(());
    }

    repo.end(session.id, "X", Utc::now()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(contact_queue_key(1, 42), "c:1:42");
        assert_eq!(dead_letter_key(1, 42), "c:1:42:dead");
        assert_eq!(contact_lock_key(1, 42), "lock:c:1:42");
    }

    #[test]
    fn test_wakeup_task_json() {
        let task = Task::new(
            TYPE_HANDLE_CONTACT_EVENT,
            1,
            &HandleContactEventTask { contact_id: 42 },
        )
        .unwrap();

        assert_eq!(task.task_type, "handle_contact_event");
        assert_eq!(task.task, serde_json::json!({"contact_id": 42}));
    }

    #[test]
    fn test_envelope_serde() {
        let envelope = ContactEventEnvelope {
            event_type: TYPE_MSG_EVENT.to_string(),
            task: serde_json::json!({"msg_id": 7, "msg_uuid": Uuid::new_v4(), "text": "hi"}),
            queued_on: Utc::now(),
            error_count: 0,
        };

        let encoded = serde_json::to_string(&envelope).unwrap();
        assert!(encoded.contains(r#""type":"msg_event""#));

        let decoded: ContactEventEnvelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.event_type, "msg_event");
        assert_eq!(decoded.error_count, 0);

        // error_count defaults when absent
        let decoded: ContactEventEnvelope = serde_json::from_str(
            r#"{"type": "msg_event", "task": {}, "queued_on": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(decoded.error_count, 0);
    }

    #[test]
    fn test_event_payload_serde() {
        let event = TimeoutEvent {
            session_id: 99,
            time: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        let back: TimeoutEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.session_id, 99);
        assert_eq!(back.time, event.time);
    }
}
