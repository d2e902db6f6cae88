//! Switchyard Storage - Database access layer
//!
//! This crate provides the Postgres pool, row models and the repository
//! layer used by the worker tier.

pub mod db;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
