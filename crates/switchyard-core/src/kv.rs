//! Key-value store connection management

use redis::aio::MultiplexedConnection;
use switchyard_common::config::KvConfig;
use switchyard_common::Result;
use tracing::info;

/// Key-value store client wrapper. Connections are multiplexed, so clones
/// are cheap and safe to hand to every worker.
#[derive(Clone)]
pub struct KvPool {
    client: redis::Client,
}

impl KvPool {
    /// Create a new client from configuration
    pub fn new(config: &KvConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self { client })
    }

    /// Get a connection for issuing commands
    pub async fn conn(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Check store health
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Key-value store connection established");
        Ok(())
    }
}
