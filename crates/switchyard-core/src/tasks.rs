//! Task registry and worker pools
//!
//! Workers pop task envelopes off a queue and dispatch them by type string
//! to registered handlers. A failed task is re-pushed with an incremented
//! error count up to a small cap; tasks are coarse-grained and recomputable
//! from persistent state, so redelivery is safe.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use switchyard_common::{Error, Result};
use switchyard_storage::models::{Broadcast, BroadcastBatch};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::broadcast;
use crate::handler::{self, HandleContactEventTask};
use crate::queue::{self, Queue, Task, DEFAULT_PRIORITY};
use crate::runtime::Runtime;

/// Top-level deadline for a single task
const TASK_DEADLINE: Duration = Duration::from_secs(60 * 60);

/// How long an idle worker sleeps between polls
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts before a failed task is dropped
const MAX_TASK_ATTEMPTS: i32 = 3;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A handler for one task type
pub type TaskHandler = Arc<dyn Fn(Arc<Runtime>, Task) -> TaskFuture + Send + Sync>;

/// Maps task type strings to their handlers
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, TaskHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type
    pub fn register<F, Fut>(&mut self, task_type: impl Into<String>, f: F)
    where
        F: Fn(Arc<Runtime>, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |rt, task| -> TaskFuture { Box::pin(f(rt, task)) });
        self.handlers.insert(task_type.into(), handler);
    }

    /// Perform one task under the top-level deadline
    pub async fn perform(&self, rt: Arc<Runtime>, task: Task) -> Result<()> {
        let handler = self
            .handlers
            .get(&task.task_type)
            .ok_or_else(|| Error::UnknownTaskType(task.task_type.clone()))?;

        match tokio::time::timeout(TASK_DEADLINE, handler(rt, task)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Other(anyhow::anyhow!("task deadline exceeded"))),
        }
    }
}

/// The registry with the core task types wired up
pub fn default_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    registry.register(broadcast::TYPE_SEND_BROADCAST, |rt, task| async move {
        let bcast: Broadcast = serde_json::from_value(task.task)?;
        broadcast::create_broadcast_batches(&rt, &bcast).await?;
        Ok(())
    });

    registry.register(broadcast::TYPE_SEND_BROADCAST_BATCH, |rt, task| async move {
        let batch: BroadcastBatch = serde_json::from_value(task.task)?;
        broadcast::send_broadcast_batch(&rt, &batch).await?;
        Ok(())
    });

    registry.register(handler::TYPE_HANDLE_CONTACT_EVENT, |rt, task| async move {
        let wakeup: HandleContactEventTask = serde_json::from_value(task.task)?;
        handler::handle_contact_event(&rt, task.owner_id, wakeup.contact_id).await
    });

    registry
}

/// Spawn a pool of workers consuming the given queue. Workers stop after
/// their in-flight task once `quit` closes.
pub fn start_workers(
    rt: Arc<Runtime>,
    registry: Arc<TaskRegistry>,
    queue: Queue,
    count: usize,
    quit: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|n| {
            let rt = rt.clone();
            let registry = registry.clone();
            let quit = quit.clone();
            tokio::spawn(worker_loop(rt, registry, queue, n, quit))
        })
        .collect()
}

async fn worker_loop(
    rt: Arc<Runtime>,
    registry: Arc<TaskRegistry>,
    queue: Queue,
    n: usize,
    mut quit: watch::Receiver<bool>,
) {
    info!(queue = %queue, worker = n, "worker started");

    loop {
        if *quit.borrow() {
            break;
        }

        let popped = pop_next(&rt, queue).await;

        match popped {
            Ok(Some(task)) => {
                perform_task(&rt, &registry, queue, task).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = quit.changed() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
            Err(e) => {
                error!(queue = %queue, worker = n, error = %e, "error popping task");
                tokio::select! {
                    _ = quit.changed() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        }
    }

    info!(queue = %queue, worker = n, "worker stopped");
}

async fn pop_next(rt: &Runtime, queue: Queue) -> Result<Option<Task>> {
    let mut conn = rt.kv.conn().await?;
    queue::pop(&mut conn, queue).await
}

async fn perform_task(rt: &Arc<Runtime>, registry: &TaskRegistry, queue: Queue, task: Task) {
    let task_type = task.task_type.clone();
    let org_id = task.owner_id;
    let errors = task.error_count;

    debug!(queue = %queue, task_type = %task_type, org_id, "performing task");

    match registry.perform(rt.clone(), task.clone()).await {
        Ok(()) => {}
        Err(Error::UnknownTaskType(t)) => {
            // permanent, redelivery can't fix it
            error!(queue = %queue, task_type = %t, org_id, "unknown task type, discarding");
        }
        Err(e) => {
            if errors + 1 < MAX_TASK_ATTEMPTS && e.is_transient() {
                error!(queue = %queue, task_type = %task_type, org_id, error = %e,
                    errors = errors + 1, "error performing task, re-queueing");

                let mut retry = task;
                retry.error_count += 1;
                if let Err(push_err) = requeue(rt, queue, retry).await {
                    error!(queue = %queue, task_type = %task_type, org_id, error = %push_err,
                        "error re-queueing failed task");
                }
            } else {
                error!(queue = %queue, task_type = %task_type, org_id, error = %e,
                    "task failed permanently, dropping");
            }
        }
    }
}

async fn requeue(rt: &Runtime, queue: Queue, task: Task) -> Result<()> {
    let mut conn = rt.kv.conn().await?;
    queue::push(&mut conn, queue, task.owner_id, DEFAULT_PRIORITY, &task).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_core_types() {
        let registry = default_registry();
        assert!(registry.handlers.contains_key("send_broadcast"));
        assert!(registry.handlers.contains_key("send_broadcast_batch"));
        assert!(registry.handlers.contains_key("handle_contact_event"));
    }
}
