//! Idempotency markers for at-least-once event delivery.
//!
//! A marker's presence means "this event already mutated the cache". Markers
//! are never overwritten and disappear only when their TTL runs out; a
//! redelivery that arrives after expiry is applied again.

use std::sync::Arc;
use std::time::Duration;

use super::backend::{BackendError, CacheBackend, Command, WatchSnapshot};
use super::keys::CacheKey;

#[derive(Clone)]
pub struct IdempotencyGuard {
    backend: Arc<dyn CacheBackend>,
}

impl IdempotencyGuard {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Single atomic check-and-set. `true` means first sighting: proceed.
    pub async fn claim(&self, key: &CacheKey, ttl: Duration) -> Result<bool, BackendError> {
        debug_assert!(key.is_marker(), "claim called with non-marker key {key}");
        self.backend.set_if_absent(&key.to_string(), ttl).await
    }

    /// Whether a watched marker was already present when `snapshot` was taken.
    pub fn is_claimed(&self, snapshot: &WatchSnapshot, key: &CacheKey) -> bool {
        snapshot.exists(&key.to_string())
    }

    /// The claim as a command, for use inside a watched transaction.
    pub fn claim_command(&self, key: &CacheKey, ttl: Duration) -> Command {
        Command::SetMarker {
            key: key.to_string(),
            ttl,
        }
    }
}
