//! Backing cache store abstraction.
//!
//! Models the subset of a remote key-value cache the engine relies on:
//! field maps (hashes), ranked sets, and TTL markers, plus pipelined batches
//! and optimistic watch/commit transactions.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Field map stored under a hash key.
pub type FieldMap = HashMap<String, String>;

/// A hash read back from the store with its remaining lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHash {
    pub fields: FieldMap,
    pub ttl: Option<Duration>,
}

/// One write in a pipeline or transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a marker unless the key already exists.
    SetMarker { key: String, ttl: Duration },
    /// Merge fields into a hash, creating it when absent.
    HashSetAll { key: String, fields: FieldMap },
    HashSet {
        key: String,
        field: String,
        value: String,
    },
    HashIncrement {
        key: String,
        field: String,
        delta: i64,
    },
    Expire { key: String, ttl: Duration },
    /// Add or rescore a ranked-set member.
    SortedAdd {
        key: String,
        member: String,
        score: i64,
    },
    /// Drop the lowest-ranked members until at most `keep` remain.
    SortedTrim { key: String, keep: usize },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::SetMarker { key, .. }
            | Command::HashSetAll { key, .. }
            | Command::HashSet { key, .. }
            | Command::HashIncrement { key, .. }
            | Command::Expire { key, .. }
            | Command::SortedAdd { key, .. }
            | Command::SortedTrim { key, .. } => key,
        }
    }
}

/// Result of a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Flag(bool),
    Integer(i64),
    Removed(usize),
}

/// Key versions captured by [`CacheBackend::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSnapshot {
    keys: Vec<WatchedKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedKey {
    pub key: String,
    pub version: u64,
    pub exists: bool,
}

impl WatchSnapshot {
    pub fn new(keys: Vec<WatchedKey>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &[WatchedKey] {
        &self.keys
    }

    /// Whether `key` existed when the snapshot was taken. Unwatched keys
    /// report `false`.
    pub fn exists(&self, key: &str) -> bool {
        self.keys
            .iter()
            .any(|watched| watched.key == key && watched.exists)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("watched keys changed before commit")]
    Conflict,
    #[error("cache backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("key `{key}` holds a value of the wrong type")]
    WrongType { key: String },
}

impl BackendError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn wrong_type(key: impl Into<String>) -> Self {
        Self::WrongType { key: key.into() }
    }

    /// Transient errors may succeed when the operation is repeated.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BackendError::WrongType { .. })
    }
}

/// The operations the engine needs from its backing cache store.
///
/// `pipeline` and `commit` are all-or-nothing: a failed batch leaves no
/// partial writes behind.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get_hash(&self, key: &str) -> Result<Option<StoredHash>, BackendError>;

    /// Reads many hashes in one round trip, preserving input order.
    async fn get_hashes(&self, keys: &[String]) -> Result<Vec<Option<StoredHash>>, BackendError>;

    /// Members of a ranked set ordered by descending score.
    async fn range_desc(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, BackendError>;

    /// Atomic set-if-absent with expiry. Returns `true` when the key was created.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, BackendError>;

    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>, BackendError>;

    async fn watch(&self, keys: &[String]) -> Result<WatchSnapshot, BackendError>;

    /// Applies `commands` atomically unless a watched key changed since
    /// `snapshot`, in which case [`BackendError::Conflict`] is returned.
    async fn commit(
        &self,
        snapshot: &WatchSnapshot,
        commands: Vec<Command>,
    ) -> Result<Vec<Reply>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_wrong_type_is_permanent() {
        assert!(BackendError::unavailable("down").is_transient());
        assert!(BackendError::Conflict.is_transient());
        assert!(BackendError::Timeout(Duration::from_millis(5)).is_transient());
        assert!(!BackendError::wrong_type("post:1").is_transient());
    }

    #[test]
    fn snapshot_reports_presence_per_key() {
        let snapshot = WatchSnapshot::new(vec![
            WatchedKey {
                key: "like:1".into(),
                version: 0,
                exists: false,
            },
            WatchedKey {
                key: "post:1".into(),
                version: 4,
                exists: true,
            },
        ]);

        assert!(snapshot.exists("post:1"));
        assert!(!snapshot.exists("like:1"));
        assert!(!snapshot.exists("post:2"));
    }
}
