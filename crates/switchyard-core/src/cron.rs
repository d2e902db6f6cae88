//! Distributed cron runner
//!
//! Each job gets a supervisor task that sleeps until the next fire time,
//! then tries to grab a named lock on the key-value store. If the lock is
//! held (by any process, including this one) the fire is skipped; there is
//! no inter-process coordination beyond the lock, so jobs must tolerate
//! missed and extra fires.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::lock::Lock;
use crate::runtime::Runtime;

/// How long a single cron run may take, also the lock TTL
const CRON_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Runs slower than this get logged at WARN
const SLOW_THRESHOLD: Duration = Duration::from_secs(60);

/// What a cron run returns: a map of counts for the completion log line
pub type CronResult = anyhow::Result<serde_json::Value>;

/// The boxed future a cron job runs
pub type CronFuture = Pin<Box<dyn Future<Output = CronResult> + Send>>;

/// A cron job function
pub type CronFunc = Arc<dyn Fn(Arc<Runtime>) -> CronFuture + Send + Sync>;

/// Adapt a plain async function into a [`CronFunc`]
pub fn cron_fn<F, Fut>(f: F) -> CronFunc
where
    F: Fn(Arc<Runtime>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CronResult> + Send + 'static,
{
    Arc::new(move |rt| -> CronFuture { Box::pin(f(rt)) })
}

/// Start a supervisor for the named job, firing it every interval while
/// holding the job's lock. Jobs with `all_instances` run on every instance
/// by suffixing the lock with the instance name. The supervisor returns
/// after the in-flight run finishes once `quit` closes.
pub fn start(
    rt: Arc<Runtime>,
    name: &'static str,
    interval: Duration,
    all_instances: bool,
    func: CronFunc,
    mut quit: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    // for historical reasons...
    let mut lock_name = format!("lock:{}_lock", name);

    if all_instances {
        lock_name = format!("{}:{}", lock_name, rt.config.instance_name);
    }

    let lock = Lock::new(lock_name, CRON_TIMEOUT);

    tokio::spawn(async move {
        let mut wait = Duration::ZERO;
        let mut last_fire = Utc::now();

        loop {
            tokio::select! {
                _ = quit.changed() => {
                    info!(cron = name, "cron exiting");
                    return;
                }

                _ = tokio::time::sleep(wait) => {
                    last_fire = Utc::now();
                    fire(&rt, name, &lock, &func).await;
                }
            }

            let next = next_fire(last_fire, interval);
            wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        }
    })
}

async fn fire(rt: &Arc<Runtime>, name: &'static str, lock: &Lock, func: &CronFunc) {
    let mut conn = match rt.kv.conn().await {
        Ok(conn) => conn,
        Err(e) => {
            error!(cron = name, error = %e, "error connecting to key-value store");
            return;
        }
    };

    // no retries, a held lock means the job is running somewhere
    let token = match lock.grab(&mut conn, 0).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            debug!(cron = name, "lock already present, skipping");
            return;
        }
        Err(e) => {
            error!(cron = name, error = %e, "error grabbing cron lock");
            return;
        }
    };

    let started = std::time::Instant::now();

    // run in its own task so a panic is contained and logged
    let run = {
        let rt = rt.clone();
        let func = func.clone();
        tokio::spawn(async move { tokio::time::timeout(CRON_TIMEOUT, func(rt)).await })
    };

    let result = match run.await {
        Ok(Ok(Ok(result))) => Some(result),
        Ok(Ok(Err(e))) => {
            error!(cron = name, error = %e, "error while running cron");
            None
        }
        Ok(Err(_)) => {
            error!(cron = name, "cron timed out");
            None
        }
        Err(join_err) if join_err.is_panic() => {
            error!(cron = name, "panic running cron: {}", join_err);
            None
        }
        Err(_) => None,
    };

    let elapsed = started.elapsed();

    if let Err(e) = lock.release(&mut conn, &token).await {
        error!(cron = name, error = %e, "error releasing cron lock");
    }

    if elapsed > SLOW_THRESHOLD {
        warn!(cron = name, elapsed = ?elapsed, result = ?result, "cron took too long");
    } else {
        info!(cron = name, elapsed = ?elapsed, result = ?result, "cron completed");
    }
}

/// The next time a job should fire given when it last fired.
///
/// Sub-minute intervals align to the next multiple of the interval relative
/// to the top of the minute, one-minute intervals fire one second past the
/// minute boundary, anything longer just adds the interval.
pub fn next_fire(last: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    if interval >= Duration::from_secs(1) && interval < Duration::from_secs(60) {
        let secs = interval.as_secs() as i64;
        let normalized = secs - (last.second() as i64 % secs);
        last + chrono::Duration::seconds(normalized)
    } else if interval == Duration::from_secs(60) {
        let to_boundary = 60 - last.second() as i64 + 1;
        last + chrono::Duration::seconds(to_boundary)
    } else {
        last + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 28, 9, min, sec).unwrap()
    }

    #[test]
    fn test_next_fire_sub_minute() {
        // aligns to multiples of the interval past the minute
        assert_eq!(next_fire(at(10, 0), Duration::from_secs(15)), at(10, 15));
        assert_eq!(next_fire(at(10, 2), Duration::from_secs(15)), at(10, 15));
        assert_eq!(next_fire(at(10, 47), Duration::from_secs(15)), at(11, 0));
        assert_eq!(next_fire(at(10, 58), Duration::from_secs(10)), at(11, 0));
    }

    #[test]
    fn test_next_fire_minute() {
        // one second past the next minute boundary
        assert_eq!(next_fire(at(10, 0), Duration::from_secs(60)), at(11, 1));
        assert_eq!(next_fire(at(10, 20), Duration::from_secs(60)), at(11, 1));
        assert_eq!(next_fire(at(10, 59), Duration::from_secs(60)), at(11, 1));
    }

    #[test]
    fn test_next_fire_longer() {
        assert_eq!(
            next_fire(at(10, 30), Duration::from_secs(30 * 60)),
            Utc.with_ymd_and_hms(2024, 8, 28, 9, 40, 30).unwrap()
        );
    }

    #[test]
    fn test_next_fire_monotonic() {
        let interval = Duration::from_secs(15);
        for sec in 0..60 {
            let last = at(10, sec);
            let next = next_fire(last, interval);
            assert!(next > last, "next fire must advance from :{:02}", sec);
            // result is on a multiple of the interval past the minute
            assert_eq!(next.second() % 15, 0);
        }
    }
}
