//! Persistent store of queued task instances.
//!
//! The [`TaskStore`] trait is synchronous: it is called from the poll loop and
//! from worker threads, none of which run inside an async runtime. Adapters
//! backed by async drivers bridge internally.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryTaskStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresTaskStore;
pub use r#trait::{InstanceState, QueuedTaskInstance, StoreError, StoreStats, TaskStore};
