//! In-process implementation of [`CacheBackend`].
//!
//! Every key carries a version bumped on each write. Watch captures those
//! versions; commit refuses to apply when any of them moved. Expired keys
//! are invisible to readers and removed lazily or by [`MemoryBackend::purge_expired`].

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::time::Instant;
use tracing::debug;

use super::backend::{
    BackendError, CacheBackend, Command, FieldMap, Reply, StoredHash, WatchSnapshot, WatchedKey,
};
use super::lock::mutex_lock;

const METRIC_CACHE_EXPIRED: &str = "feedline_cache_expired_total";
const METRIC_CACHE_KEYS: &str = "feedline_cache_keys";

const SOURCE: &str = "cache::memory";

#[derive(Debug, Default)]
pub struct MemoryBackend {
    keyspace: Mutex<Keyspace>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    next_version: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
    version: u64,
}

#[derive(Debug, Clone)]
enum Value {
    Hash(FieldMap),
    Ranked(RankedSet),
    Marker,
}

/// Ranked set ordered by `(score, insertion sequence)`. Among equal scores
/// the later insertion ranks higher.
#[derive(Debug, Clone, Default)]
struct RankedSet {
    order: BTreeSet<(i64, u64, String)>,
    members: HashMap<String, (i64, u64)>,
    next_seq: u64,
}

impl RankedSet {
    /// Returns `true` when the set changed.
    fn add(&mut self, member: &str, score: i64) -> bool {
        if let Some(&(current, seq)) = self.members.get(member) {
            if current == score {
                return false;
            }
            self.order.remove(&(current, seq, member.to_string()));
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.order.insert((score, seq, member.to_string()));
        self.members.insert(member.to_string(), (score, seq));
        true
    }

    fn trim(&mut self, keep: usize) -> usize {
        let mut removed = 0;
        while self.order.len() > keep {
            match self.order.pop_first() {
                Some((_, _, member)) => {
                    self.members.remove(&member);
                    removed += 1;
                }
                None => break,
            }
        }
        removed
    }

    fn range_desc(&self, offset: usize, limit: usize) -> Vec<String> {
        self.order
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .map(|(_, _, member)| member.clone())
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Entry {
    fn new(value: Value, expires_at: Option<Instant>) -> Self {
        Self {
            value,
            expires_at,
            version: 0,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

impl Keyspace {
    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|entry| entry.is_live(now))
    }

    fn version_of(&self, key: &str, now: Instant) -> u64 {
        self.live(key, now).map_or(0, |entry| entry.version)
    }

    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Applies commands to staged copies of the touched entries and only
    /// writes them back once every command succeeded.
    fn apply(&mut self, commands: &[Command], now: Instant) -> Result<Vec<Reply>, BackendError> {
        let mut staged: HashMap<String, Option<Entry>> = HashMap::new();
        let mut changed: HashSet<String> = HashSet::new();
        let mut replies = Vec::with_capacity(commands.len());

        for command in commands {
            let key = command.key();
            let slot = match staged.entry(key.to_string()) {
                MapEntry::Occupied(slot) => slot.into_mut(),
                MapEntry::Vacant(slot) => slot.insert(self.live(key, now).cloned()),
            };
            let (reply, dirty) = apply_one(slot, command, now)?;
            if dirty {
                changed.insert(key.to_string());
            }
            replies.push(reply);
        }

        for key in changed {
            match staged.remove(&key).flatten() {
                Some(mut entry) => {
                    entry.version = self.bump();
                    self.entries.insert(key, entry);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }

        Ok(replies)
    }
}

fn apply_one(
    slot: &mut Option<Entry>,
    command: &Command,
    now: Instant,
) -> Result<(Reply, bool), BackendError> {
    match command {
        Command::SetMarker { ttl, .. } => {
            if slot.is_some() {
                return Ok((Reply::Flag(false), false));
            }
            *slot = Some(Entry::new(Value::Marker, Some(now + *ttl)));
            Ok((Reply::Flag(true), true))
        }
        Command::HashSetAll { key, fields } => {
            let hash = hash_mut(slot, key)?;
            hash.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok((Reply::Ok, true))
        }
        Command::HashSet { key, field, value } => {
            hash_mut(slot, key)?.insert(field.clone(), value.clone());
            Ok((Reply::Ok, true))
        }
        Command::HashIncrement { key, field, delta } => {
            let hash = hash_mut(slot, key)?;
            let current = match hash.get(field) {
                Some(raw) => raw
                    .parse::<i64>()
                    .map_err(|_| BackendError::wrong_type(key.clone()))?,
                None => 0,
            };
            let next = current + delta;
            hash.insert(field.clone(), next.to_string());
            Ok((Reply::Integer(next), true))
        }
        Command::Expire { ttl, .. } => match slot {
            Some(entry) => {
                entry.expires_at = Some(now + *ttl);
                Ok((Reply::Flag(true), true))
            }
            None => Ok((Reply::Flag(false), false)),
        },
        Command::SortedAdd { key, member, score } => {
            let set = ranked_mut(slot, key)?;
            let dirty = set.add(member, *score);
            Ok((Reply::Flag(dirty), dirty))
        }
        Command::SortedTrim { key, keep } => {
            let removed = match slot {
                None => return Ok((Reply::Removed(0), false)),
                Some(Entry {
                    value: Value::Ranked(set),
                    ..
                }) => {
                    let removed = set.trim(*keep);
                    if set.is_empty() {
                        *slot = None;
                    }
                    removed
                }
                Some(_) => return Err(BackendError::wrong_type(key.clone())),
            };
            Ok((Reply::Removed(removed), removed > 0))
        }
    }
}

fn hash_mut<'a>(slot: &'a mut Option<Entry>, key: &str) -> Result<&'a mut FieldMap, BackendError> {
    let entry = slot.get_or_insert_with(|| Entry::new(Value::Hash(FieldMap::new()), None));
    match &mut entry.value {
        Value::Hash(hash) => Ok(hash),
        _ => Err(BackendError::wrong_type(key)),
    }
}

fn ranked_mut<'a>(
    slot: &'a mut Option<Entry>,
    key: &str,
) -> Result<&'a mut RankedSet, BackendError> {
    let entry = slot.get_or_insert_with(|| Entry::new(Value::Ranked(RankedSet::default()), None));
    match &mut entry.value {
        Value::Ranked(set) => Ok(set),
        _ => Err(BackendError::wrong_type(key)),
    }
}

fn stored_hash(entry: &Entry, key: &str, now: Instant) -> Result<StoredHash, BackendError> {
    match &entry.value {
        Value::Hash(fields) => Ok(StoredHash {
            fields: fields.clone(),
            ttl: entry.expires_at.map(|at| at.saturating_duration_since(now)),
        }),
        _ => Err(BackendError::wrong_type(key)),
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "purge_expired");
        let before = keyspace.entries.len();
        keyspace.entries.retain(|_, entry| entry.is_live(now));
        let removed = before - keyspace.entries.len();
        gauge!(METRIC_CACHE_KEYS).set(keyspace.entries.len() as f64);
        if removed > 0 {
            counter!(METRIC_CACHE_EXPIRED).increment(removed as u64);
            debug!(
                target = "cache::memory",
                removed, "Purged expired cache keys"
            );
        }
        removed
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        mutex_lock(&self.keyspace, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of a live key. `None` when absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let keyspace = mutex_lock(&self.keyspace, SOURCE, "ttl");
        keyspace
            .live(key, now)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get_hash(&self, key: &str) -> Result<Option<StoredHash>, BackendError> {
        let now = Instant::now();
        let keyspace = mutex_lock(&self.keyspace, SOURCE, "get_hash");
        keyspace
            .live(key, now)
            .map(|entry| stored_hash(entry, key, now))
            .transpose()
    }

    async fn get_hashes(&self, keys: &[String]) -> Result<Vec<Option<StoredHash>>, BackendError> {
        let now = Instant::now();
        let keyspace = mutex_lock(&self.keyspace, SOURCE, "get_hashes");
        keys.iter()
            .map(|key| {
                keyspace
                    .live(key, now)
                    .map(|entry| stored_hash(entry, key, now))
                    .transpose()
            })
            .collect()
    }

    async fn range_desc(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, BackendError> {
        let now = Instant::now();
        let keyspace = mutex_lock(&self.keyspace, SOURCE, "range_desc");
        match keyspace.live(key, now).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::Ranked(set)) => Ok(set.range_desc(offset, limit)),
            Some(_) => Err(BackendError::wrong_type(key)),
        }
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "set_if_absent");
        let replies = keyspace.apply(
            &[Command::SetMarker {
                key: key.to_string(),
                ttl,
            }],
            now,
        )?;
        Ok(matches!(replies.first(), Some(Reply::Flag(true))))
    }

    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>, BackendError> {
        let now = Instant::now();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "pipeline");
        keyspace.apply(&commands, now)
    }

    async fn watch(&self, keys: &[String]) -> Result<WatchSnapshot, BackendError> {
        let now = Instant::now();
        let keyspace = mutex_lock(&self.keyspace, SOURCE, "watch");
        let watched = keys
            .iter()
            .map(|key| {
                let live = keyspace.live(key, now);
                WatchedKey {
                    key: key.clone(),
                    version: live.map_or(0, |entry| entry.version),
                    exists: live.is_some(),
                }
            })
            .collect();
        Ok(WatchSnapshot::new(watched))
    }

    async fn commit(
        &self,
        snapshot: &WatchSnapshot,
        commands: Vec<Command>,
    ) -> Result<Vec<Reply>, BackendError> {
        let now = Instant::now();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "commit");
        let moved = snapshot
            .keys()
            .iter()
            .any(|watched| keyspace.version_of(&watched.key, now) != watched.version);
        if moved {
            return Err(BackendError::Conflict);
        }
        keyspace.apply(&commands, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(key: &str, member: &str, score: i64) -> Command {
        Command::SortedAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        }
    }

    #[tokio::test]
    async fn ranked_set_orders_by_score_then_recency() {
        let backend = MemoryBackend::new();
        backend
            .pipeline(vec![add("feed", "a", 10), add("feed", "b", 30), add("feed", "c", 10)])
            .await
            .expect("pipeline");

        let members = backend.range_desc("feed", 0, 10).await.expect("range");
        assert_eq!(members, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn trim_drops_lowest_scores() {
        let backend = MemoryBackend::new();
        let replies = backend
            .pipeline(vec![
                add("feed", "a", 1),
                add("feed", "b", 2),
                add("feed", "c", 3),
                Command::SortedTrim {
                    key: "feed".into(),
                    keep: 2,
                },
            ])
            .await
            .expect("pipeline");

        assert_eq!(replies.last(), Some(&Reply::Removed(1)));
        let members = backend.range_desc("feed", 0, 10).await.expect("range");
        assert_eq!(members, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn failed_pipeline_applies_nothing() {
        let backend = MemoryBackend::new();
        backend
            .set_if_absent("marker", Duration::from_secs(60))
            .await
            .expect("marker");

        let result = backend
            .pipeline(vec![
                Command::HashSet {
                    key: "post:1".into(),
                    field: "content".into(),
                    value: "x".into(),
                },
                Command::HashSet {
                    key: "marker".into(),
                    field: "content".into(),
                    value: "y".into(),
                },
            ])
            .await;

        assert_eq!(result, Err(BackendError::wrong_type("marker")));
        assert!(backend.get_hash("post:1").await.expect("read").is_none());
    }

    #[tokio::test]
    async fn commit_rejects_moved_keys() {
        let backend = MemoryBackend::new();
        let keys = vec!["post:1".to_string()];
        let snapshot = backend.watch(&keys).await.expect("watch");

        backend
            .pipeline(vec![Command::HashIncrement {
                key: "post:1".into(),
                field: "like_count".into(),
                delta: 1,
            }])
            .await
            .expect("concurrent write");

        let result = backend
            .commit(
                &snapshot,
                vec![Command::HashIncrement {
                    key: "post:1".into(),
                    field: "like_count".into(),
                    delta: 1,
                }],
            )
            .await;
        assert_eq!(result, Err(BackendError::Conflict));

        let retry = backend.watch(&keys).await.expect("rewatch");
        assert!(retry.exists("post:1"));
        let replies = backend
            .commit(
                &retry,
                vec![Command::HashIncrement {
                    key: "post:1".into(),
                    field: "like_count".into(),
                    delta: 1,
                }],
            )
            .await
            .expect("commit");
        assert_eq!(replies, vec![Reply::Integer(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn markers_expire() {
        let backend = MemoryBackend::new();
        assert!(
            backend
                .set_if_absent("like:1", Duration::from_secs(5))
                .await
                .expect("first")
        );
        assert!(
            !backend
                .set_if_absent("like:1", Duration::from_secs(5))
                .await
                .expect("second")
        );

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(backend.ttl("like:1"), None);
        assert_eq!(backend.purge_expired(), 1);
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hash_ttl_is_reported() {
        let backend = MemoryBackend::new();
        backend
            .pipeline(vec![
                Command::HashSet {
                    key: "post:2".into(),
                    field: "content".into(),
                    value: "hi".into(),
                },
                Command::Expire {
                    key: "post:2".into(),
                    ttl: Duration::from_secs(100),
                },
            ])
            .await
            .expect("pipeline");

        tokio::time::advance(Duration::from_secs(40)).await;

        let stored = backend
            .get_hash("post:2")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(stored.ttl, Some(Duration::from_secs(60)));
        assert_eq!(backend.ttl("post:2"), Some(Duration::from_secs(60)));
    }
}
