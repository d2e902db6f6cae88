//! Named expiring locks on the key-value store
//!
//! Locks are opaque tokens: releasing requires presenting the token obtained
//! at acquisition, so an expired lock stolen by another process can't be
//! released by the original holder.

use std::time::Duration;

use rand::Rng;
use redis::aio::MultiplexedConnection;
use switchyard_common::Result;
use uuid::Uuid;

// delete only if the token still matches
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// A named lock with a TTL
pub struct Lock {
    name: String,
    ttl: Duration,
}

impl Lock {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to acquire the lock, retrying up to `retries` times with short
    /// randomised sleeps. Returns the release token, or None if the lock is
    /// held elsewhere.
    pub async fn grab(
        &self,
        conn: &mut MultiplexedConnection,
        retries: u32,
    ) -> Result<Option<String>> {
        let token = Uuid::new_v4().simple().to_string();

        for attempt in 0..=retries {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&self.name)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.ttl.as_millis() as u64)
                .query_async(conn)
                .await?;

            if acquired.is_some() {
                return Ok(Some(token));
            }

            if attempt < retries {
                let wait = { rand::thread_rng().gen_range(100..500) };
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
        }

        Ok(None)
    }

    /// Release the lock if we still hold it
    pub async fn release(&self, conn: &mut MultiplexedConnection, token: &str) -> Result<()> {
        let script = redis::Script::new(RELEASE_SCRIPT);
        let _: i32 = script.key(&self.name).arg(token).invoke_async(conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_name() {
        let lock = Lock::new("lock:timeouts_lock", Duration::from_secs(300));
        assert_eq!(lock.name(), "lock:timeouts_lock");
    }
}
