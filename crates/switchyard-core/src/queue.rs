//! Fair multi-tenant priority queue on the key-value store
//!
//! A queue identifies a work domain (`handler` or `batch`). Per queue, each
//! org has one ordered list per priority. A sorted set `{queue}:active`
//! indexes the orgs that currently have work, keyed `{priority}:{org}` and
//! scored so that higher-priority buckets always sort earlier and orgs
//! within a bucket rotate fairly round-robin.

use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use switchyard_common::types::OrgId;
use switchyard_common::Result;

/// Default task priority
pub const DEFAULT_PRIORITY: i32 = 0;

/// High task priority, popped before any default priority work
pub const HIGH_PRIORITY: i32 = -10000;

// spreads priority buckets far enough apart that the rotation counter can
// never push one bucket into another
const PRIORITY_SCALE: i64 = 1_000_000_000;

/// A work domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    /// Contact event wake-ups and small sends
    Handler,
    /// Broadcast batches and other coarse-grained work
    Batch,
}

impl Queue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Handler => "handler",
            Queue::Batch => "batch",
        }
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.as_str())
    }

    fn counter_key(&self) -> String {
        format!("{}:counter", self.as_str())
    }

    fn list_key(&self, org_id: OrgId, priority: i32) -> String {
        format!("{}:{}:{}", self.as_str(), org_id, priority)
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The envelope that lives on a queue list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "type")]
    pub task_type: String,
    pub owner_id: OrgId,
    pub task: serde_json::Value,
    pub queued_on: DateTime<Utc>,
    #[serde(default)]
    pub error_count: i32,
}

impl Task {
    /// Wrap a payload in a task envelope
    pub fn new(task_type: impl Into<String>, owner_id: OrgId, payload: &impl Serialize) -> Result<Task> {
        Ok(Task {
            task_type: task_type.into(),
            owner_id,
            task: serde_json::to_value(payload)?,
            queued_on: Utc::now(),
            error_count: 0,
        })
    }
}

fn active_member(org_id: OrgId, priority: i32) -> String {
    format!("{}:{}", priority, org_id)
}

fn active_score(priority: i32, counter: i64) -> i64 {
    priority as i64 * PRIORITY_SCALE + counter
}

// atomically: read the lowest-scored active entry, pop the head of its
// list, and either remove the entry (list drained) or rotate it to the back
// of its bucket with a fresh counter score
const POP_SCRIPT: &str = r#"
local entry = redis.call("ZRANGE", KEYS[1], 0, 0)
if #entry == 0 then
    return false
end

local member = entry[1]
local sep = string.find(member, ":")
local priority = tonumber(string.sub(member, 1, sep - 1))
local org = string.sub(member, sep + 1)
local list = ARGV[1] .. ":" .. org .. ":" .. priority

local payload = redis.call("LPOP", list)
if not payload then
    redis.call("ZREM", KEYS[1], member)
    return false
end

if redis.call("LLEN", list) == 0 then
    redis.call("ZREM", KEYS[1], member)
else
    local counter = redis.call("INCR", KEYS[2])
    redis.call("ZADD", KEYS[1], priority * 1000000000 + counter, member)
end

return payload
"#;

/// Push a task onto the given queue for an org. A newly-activated org goes
/// to the back of its priority bucket; an org that already has work keeps
/// its place.
pub async fn push(
    conn: &mut MultiplexedConnection,
    queue: Queue,
    org_id: OrgId,
    priority: i32,
    task: &Task,
) -> Result<()> {
    let payload = serde_json::to_string(task)?;

    let _: i64 = redis::cmd("RPUSH")
        .arg(queue.list_key(org_id, priority))
        .arg(&payload)
        .query_async(conn)
        .await?;

    let counter: i64 = redis::cmd("INCR")
        .arg(queue.counter_key())
        .query_async(conn)
        .await?;

    let _: i64 = redis::cmd("ZADD")
        .arg(queue.active_key())
        .arg("NX")
        .arg(active_score(priority, counter))
        .arg(active_member(org_id, priority))
        .query_async(conn)
        .await?;

    Ok(())
}

/// Pop the next task off the given queue, or None if it is empty
pub async fn pop(conn: &mut MultiplexedConnection, queue: Queue) -> Result<Option<Task>> {
    let script = redis::Script::new(POP_SCRIPT);

    // a popped entry can race a concurrent drain, in which case the script
    // removes the stale entry and we look again
    for _ in 0..8 {
        let payload: Option<String> = script
            .key(queue.active_key())
            .key(queue.counter_key())
            .arg(queue.as_str())
            .invoke_async(conn)
            .await?;

        match payload {
            Some(payload) => {
                let task: Task = serde_json::from_str(&payload)?;
                return Ok(Some(task));
            }
            None => {
                let size: i64 = redis::cmd("ZCARD")
                    .arg(queue.active_key())
                    .query_async(conn)
                    .await?;
                if size == 0 {
                    return Ok(None);
                }
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(Queue::Handler.active_key(), "handler:active");
        assert_eq!(Queue::Batch.counter_key(), "batch:counter");
        assert_eq!(Queue::Batch.list_key(3, 0), "batch:3:0");
        assert_eq!(Queue::Handler.list_key(3, HIGH_PRIORITY), "handler:3:-10000");
    }

    #[test]
    fn test_active_scoring() {
        // within a bucket, later activations sort later
        assert!(active_score(DEFAULT_PRIORITY, 1) < active_score(DEFAULT_PRIORITY, 2));

        // the high bucket sorts before default no matter how old the
        // default entries are
        assert!(active_score(HIGH_PRIORITY, 1_000_000) < active_score(DEFAULT_PRIORITY, 1));

        assert_eq!(active_member(12, HIGH_PRIORITY), "-10000:12");
    }

    #[test]
    fn test_task_envelope_serde() {
        let task = Task::new("send_broadcast", 5, &serde_json::json!({"broadcast_id": 7})).unwrap();
        let encoded = serde_json::to_string(&task).unwrap();

        let decoded: Task = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.task_type, "send_broadcast");
        assert_eq!(decoded.owner_id, 5);
        assert_eq!(decoded.task["broadcast_id"], 7);
        assert_eq!(decoded.error_count, 0);

        // error_count defaults when absent
        let decoded: Task = serde_json::from_str(
            r#"{"type": "x", "owner_id": 1, "task": {}, "queued_on": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(decoded.error_count, 0);
    }
}
