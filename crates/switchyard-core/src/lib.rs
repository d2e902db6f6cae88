//! Switchyard Core - Queueing, cron, and the worker pipelines
//!
//! This crate provides the hard systems core of the worker tier: the fair
//! multi-tenant task queue, the distributed cron runner, the per-contact
//! event serialiser, broadcast fan-out and the ticket lifecycle.

pub mod assets;
pub mod broadcast;
pub mod cron;
pub mod expr;
pub mod handler;
pub mod http;
pub mod jobs;
pub mod kv;
pub mod lock;
pub mod queue;
pub mod runtime;
pub mod search;
pub mod tasks;
pub mod tickets;

pub use assets::{AssetCache, OrgAssets};
pub use http::{HttpClient, HttpLogger};
pub use kv::KvPool;
pub use runtime::Runtime;
pub use search::SearchBackend;
pub use tickets::{ProviderRegistry, TicketProvider};
