//! The cron job suite
//!
//! Each function here runs under the cron runner's lock and deadline and
//! returns a map of counts for the completion log line.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use switchyard_storage::repository::{
    BroadcastRepository, MsgRepository, ScheduleRepository, SessionRepository,
};
use tracing::warn;

use crate::broadcast::TYPE_SEND_BROADCAST;
use crate::cron::CronResult;
use crate::handler::{self, ExpirationEvent, TimeoutEvent};
use crate::queue::{self, Queue, Task, DEFAULT_PRIORITY};
use crate::runtime::Runtime;

const RETRY_BATCH_LIMIT: i64 = 5000;

/// Put errored outbound messages back on the courier queue
pub async fn retry_errored_messages(rt: Arc<Runtime>) -> CronResult {
    let repo = MsgRepository::new(rt.db.pool().clone());
    let retried = repo.retry_errored(RETRY_BATCH_LIMIT).await?;

    Ok(json!({ "retried": retried }))
}

/// Queue a timeout event for every waiting session whose timeout has
/// elapsed
pub async fn timeout_sessions(rt: Arc<Runtime>) -> CronResult {
    let repo = SessionRepository::new(rt.db.pool().clone());
    let sessions = repo.timed_out(Utc::now()).await?;

    let mut conn = rt.kv.conn().await?;
    let mut queued = 0;

    for session in sessions {
        let Some(timeout_on) = session.timeout_on else {
            continue;
        };

        handler::queue_contact_event(
            &mut conn,
            session.org_id,
            session.contact_id,
            handler::TYPE_TIMEOUT_EVENT,
            &TimeoutEvent {
                session_id: session.id,
                time: timeout_on,
            },
        )
        .await?;
        queued += 1;
    }

    Ok(json!({ "queued": queued }))
}

/// Queue an expiration event for every waiting session past its wait
/// expiry
pub async fn expire_runs(rt: Arc<Runtime>) -> CronResult {
    let repo = SessionRepository::new(rt.db.pool().clone());
    let sessions = repo.expired(Utc::now()).await?;

    let mut conn = rt.kv.conn().await?;
    let mut queued = 0;

    for session in sessions {
        let Some(expires_on) = session.wait_expires_on else {
            continue;
        };

        handler::queue_contact_event(
            &mut conn,
            session.org_id,
            session.contact_id,
            handler::TYPE_EXPIRATION_EVENT,
            &ExpirationEvent {
                session_id: session.id,
                time: expires_on,
            },
        )
        .await?;
        queued += 1;
    }

    Ok(json!({ "queued": queued }))
}

/// Fire due scheduled broadcasts: each spawns a child broadcast and a
/// `send_broadcast` task, then the schedule advances
pub async fn fire_scheduled_broadcasts(rt: Arc<Runtime>) -> CronResult {
    let pool = rt.db.pool().clone();
    let schedules = ScheduleRepository::new(pool.clone());
    let broadcasts = BroadcastRepository::new(pool);

    let now = Utc::now();
    let due = schedules.due(now).await?;

    let mut conn = rt.kv.conn().await?;
    let mut fired = 0;

    for schedule in due {
        match broadcasts.get_for_schedule(schedule.id).await? {
            Some(parent) => {
                let child = broadcasts.insert_child(&parent).await?;
                let task = Task::new(TYPE_SEND_BROADCAST, child.org_id, &child)?;
                queue::push(&mut conn, Queue::Batch, child.org_id, DEFAULT_PRIORITY, &task).await?;
                fired += 1;
            }
            None => {
                warn!(schedule_id = schedule.id, "schedule has no broadcast, skipping");
            }
        }

        schedules
            .mark_fired(schedule.id, now, schedule.fire_after(now))
            .await?;
    }

    Ok(json!({ "fired": fired }))
}

/// Interrupt waiting sessions belonging to blocked or stopped contacts
pub async fn interrupt_sessions(rt: Arc<Runtime>) -> CronResult {
    let repo = SessionRepository::new(rt.db.pool().clone());
    let interrupted = repo.interrupt_for_inactive_contacts(Utc::now()).await?;

    Ok(json!({ "interrupted": interrupted }))
}
