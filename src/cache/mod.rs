//! Feed cache engine.
//!
//! Two structures live in the backing cache store:
//!
//! - **Feed index**: one bounded ranked set of post ids per user
//! - **Post cache**: one denormalized hash per post, refreshed on every write
//!
//! Events mutate post records under idempotency markers so redelivered
//! events apply once within the marker TTL.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! feed_size = 500
//! recent_comments = 3
//! post_ttl_seconds = 86400
//! # ... see config.rs for all options
//! ```

mod backend;
mod config;
mod error;
mod feed_index;
mod idempotency;
mod keys;
mod loader;
mod lock;
mod memory;
mod post_store;
mod retry;

pub use backend::{
    BackendError, CacheBackend, Command, FieldMap, Reply, StoredHash, WatchSnapshot, WatchedKey,
};
pub use config::{CacheConfig, apply_timeout_for};
pub use error::CacheError;
pub use feed_index::FeedIndexStore;
pub use idempotency::IdempotencyGuard;
pub use keys::CacheKey;
pub use loader::CanonicalLoader;
pub use memory::MemoryBackend;
pub use post_store::{CounterField, PostCacheStore};
pub use retry::{RetryPolicy, Transient};
