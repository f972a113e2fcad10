//! Embedded SQLite storage engine for conversation history, summaries and
//! assembled LLM context.
//!
//! `convostore` keeps everything in one SQLite file and layers four pieces on
//! top of it:
//!
//! - a bounded **connection pool** with FIFO waiters and an acquisition timeout,
//! - a **query optimizer** with a TTL/LRU result cache, `EXPLAIN QUERY PLAN`
//!   analysis, batched inserts and execution metrics,
//! - a transactional **migration runner** with validated, reversible migrations,
//! - a persistent **context cache** repository with per-entry expiry.
//!
//! [`store::Store`] ties them together and is the only entry point callers need.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`db`]: connection setup, pool, migrations and the application schema
//! - [`error`]: the [`error::StorageError`] type
//! - [`query`]: result cache, plan analysis, bulk writes and reports
//! - [`repository`]: table-backed repositories, including the context cache
//! - [`store`]: the facade

pub mod config;
pub mod db;
pub mod error;
pub mod query;
pub mod repository;
pub mod store;

pub use error::{Result, StorageError};
pub use store::{Store, StoreOptions};
