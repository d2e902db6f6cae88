//! Shared runtime handles threaded through tasks and crons

use std::sync::Arc;

use switchyard_common::Config;
use switchyard_storage::DatabasePool;

use crate::assets::AssetCache;
use crate::http::HttpClient;
use crate::kv::KvPool;
use crate::search::SearchBackend;
use crate::tickets::ProviderRegistry;

/// Everything a task handler needs to do its work
pub struct Runtime {
    pub config: Config,
    pub db: DatabasePool,
    pub kv: KvPool,
    pub http: HttpClient,
    pub assets: AssetCache,
    pub providers: ProviderRegistry,
    pub search: Arc<dyn SearchBackend>,
}
