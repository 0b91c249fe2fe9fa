//! Spiderpool Store - the shared cluster resource store
//!
//! This crate provides:
//! - A `KVStore` trait with a redb-backed implementation carrying a
//!   monotonic revision per key
//! - Typed `Repository<T>` access with optimistic-concurrency writes
//! - A shared conflict-retry helper with exponential backoff
//! - A broadcast event bus publishing resource mutations
//!
//! All coordination between the agent and the controller goes through this
//! store; no in-memory entity is shared mutably across processes.

pub mod error;
pub mod event;
pub mod kv;
pub mod redb_backend;
pub mod repository;
pub mod retry;
pub mod store;

pub use error::{Result, StoreError};
pub use event::{ResourceEvent, WatchEventType};
pub use kv::{KVStore, VersionedValue};
pub use redb_backend::RedbBackend;
pub use repository::Repository;
pub use retry::{update_status_with_retry, update_with_retry, Mutation, RetryConfig};
pub use store::Store;
