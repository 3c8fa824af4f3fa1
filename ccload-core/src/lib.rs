//! # ccload-core
//!
//! Storage and routing core of the ccLoad LLM API gateway.
//!
//! This library provides:
//! - Domain types for channels, API keys, auth tokens, and request logs
//! - One SQL store serving SQLite and MySQL with dialect-aware migrations
//! - A deep-copying in-memory cache of the channel topology
//! - The exponential-backoff cooldown engine for channels and keys
//! - An optional hybrid deployment: MySQL primary with a local SQLite
//!   read replica, async log replication, and a startup restore pipeline
//!
//! ## Architecture
//!
//! The request hot path reads through [`ChannelCache`]; every mutation
//! goes to a [`Store`] implementation and is followed by an explicit
//! cache invalidation. [`factory::connect_store`] picks the deployment
//! mode from the environment.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ccload_core::{config::StoreConfig, factory, Store};
//!
//! # async fn run() -> ccload_core::Result<()> {
//! let config = StoreConfig::from_env()?;
//! let store = factory::connect_store(&config).await?;
//! let channels = store.get_enabled_channels_by_model("*").await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use cache::{CacheStats, ChannelCache};
pub use db::{Dialect, SqlStore, Store};
pub use error::{Error, Result};
pub use hybrid::HybridStore;
pub use sync::SyncManager;
pub use types::*;

// Public modules
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod factory;
pub mod hybrid;
pub mod logging;
pub mod sync;
pub mod types;
