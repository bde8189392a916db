//! Post cache store.
//!
//! One hash per post under `post:{id}`. Scalars are stored as strings,
//! `created_at` as RFC 3339 and `recent_comments` as a JSON array. Every
//! write refreshes the record's TTL.

use std::sync::Arc;

use metrics::counter;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, instrument, warn};

use crate::domain::entities::{PostCacheRecord, PostId, RecentComment};

use super::backend::{CacheBackend, Command, FieldMap, Reply, StoredHash};
use super::config::CacheConfig;
use super::error::CacheError;
use super::keys::CacheKey;
use super::loader::CanonicalLoader;
use super::retry::RetryPolicy;

const METRIC_POST_CACHE_HIT: &str = "feedline_post_cache_hit_total";
const METRIC_POST_CACHE_MISS: &str = "feedline_post_cache_miss_total";
const METRIC_POST_CACHE_DECODE_FAILURE: &str = "feedline_post_cache_decode_failure_total";

pub(crate) mod fields {
    pub const POST_ID: &str = "post_id";
    pub const AUTHOR_ID: &str = "author_id";
    pub const CONTENT: &str = "content";
    pub const CREATED_AT: &str = "created_at";
    pub const COMMENT_COUNT: &str = "comment_count";
    pub const LIKE_COUNT: &str = "like_count";
    pub const VIEW_COUNT: &str = "view_count";
    pub const RECENT_COMMENTS: &str = "recent_comments";
}

/// Counters on a cached post that events may bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterField {
    Comments,
    Likes,
    Views,
}

impl CounterField {
    pub fn as_field(self) -> &'static str {
        match self {
            CounterField::Comments => fields::COMMENT_COUNT,
            CounterField::Likes => fields::LIKE_COUNT,
            CounterField::Views => fields::VIEW_COUNT,
        }
    }
}

#[derive(Clone)]
pub struct PostCacheStore {
    backend: Arc<dyn CacheBackend>,
    loader: CanonicalLoader,
    config: CacheConfig,
    retry: RetryPolicy,
}

impl PostCacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, loader: CanonicalLoader, config: CacheConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            backend,
            loader,
            config,
            retry,
        }
    }

    pub fn loader(&self) -> &CanonicalLoader {
        &self.loader
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Cache-aside read. A miss loads the post from the canonical store,
    /// writes it through and returns it.
    ///
    /// Concurrent misses may each populate; the write is a deterministic
    /// function of canonical data so the last writer wins with equal content.
    #[instrument(skip(self))]
    pub async fn get(&self, post_id: PostId) -> Result<PostCacheRecord, CacheError> {
        if let Some(record) = self.cached(post_id).await? {
            counter!(METRIC_POST_CACHE_HIT).increment(1);
            return Ok(record);
        }

        counter!(METRIC_POST_CACHE_MISS).increment(1);
        let mut record = self.loader.load(post_id).await?;
        self.put(&record).await?;
        debug!(
            target = "cache::post_store",
            post_id, "Populated post cache from canonical store"
        );
        record.expires_in = Some(self.config.post_ttl);
        Ok(record)
    }

    /// Reads a cached record without touching the canonical store. Records
    /// that cannot be decoded are reported as absent. Reads make a single
    /// attempt; backend failures surface to the caller.
    pub async fn cached(&self, post_id: PostId) -> Result<Option<PostCacheRecord>, CacheError> {
        let key = CacheKey::Post(post_id).to_string();
        let stored = self.backend.get_hash(&key).await?;
        Ok(stored.and_then(|stored| self.decode_or_discard(post_id, stored)))
    }

    /// Reads many cached records in one round trip, preserving input order.
    pub async fn cached_many(
        &self,
        post_ids: &[PostId],
    ) -> Result<Vec<Option<PostCacheRecord>>, CacheError> {
        let keys: Vec<String> = post_ids
            .iter()
            .map(|post_id| CacheKey::Post(*post_id).to_string())
            .collect();
        let stored = self.backend.get_hashes(&keys).await?;

        Ok(post_ids
            .iter()
            .zip(stored)
            .map(|(post_id, stored)| {
                stored.and_then(|stored| self.decode_or_discard(*post_id, stored))
            })
            .collect())
    }

    fn decode_or_discard(&self, post_id: PostId, stored: StoredHash) -> Option<PostCacheRecord> {
        match decode(post_id, stored) {
            Ok(record) => Some(record),
            Err(reason) => {
                counter!(METRIC_POST_CACHE_DECODE_FAILURE).increment(1);
                warn!(
                    target = "cache::post_store",
                    post_id,
                    reason = %reason,
                    "Discarding undecodable post cache record"
                );
                None
            }
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub async fn put(&self, record: &PostCacheRecord) -> Result<(), CacheError> {
        let commands = self.write_commands(record)?;
        self.retry
            .run("post_cache.put", |_| self.backend.pipeline(commands.clone()))
            .await?;
        Ok(())
    }

    /// Writes every record in one pipelined round trip.
    pub async fn put_batch(&self, records: &[PostCacheRecord]) -> Result<(), CacheError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut commands = Vec::with_capacity(records.len() * 2);
        for record in records {
            commands.extend(self.write_commands(record)?);
        }
        self.retry
            .run("post_cache.put_batch", |_| {
                self.backend.pipeline(commands.clone())
            })
            .await?;
        Ok(())
    }

    /// Atomically bumps a counter on an existing record and returns its new
    /// value. Fails with [`CacheError::MissingRecord`] when nothing is cached.
    pub async fn increment_field(
        &self,
        post_id: PostId,
        field: CounterField,
        delta: u32,
    ) -> Result<i64, CacheError> {
        self.retry
            .run("post_cache.increment_field", |_| {
                self.increment_once(post_id, field, delta)
            })
            .await
    }

    async fn increment_once(
        &self,
        post_id: PostId,
        field: CounterField,
        delta: u32,
    ) -> Result<i64, CacheError> {
        let key = CacheKey::Post(post_id).to_string();
        let snapshot = self.backend.watch(std::slice::from_ref(&key)).await?;
        if !snapshot.exists(&key) {
            return Err(CacheError::MissingRecord { post_id });
        }
        let replies = self
            .backend
            .commit(&snapshot, self.increment_commands(post_id, field, delta))
            .await?;
        Ok(first_integer(&replies))
    }

    /// Prepends `comment`, keeps the newest `max_size` entries and bumps the
    /// comment count, all in one transaction. Returns the stored preview.
    pub async fn prepend_comment(
        &self,
        post_id: PostId,
        comment: &RecentComment,
        max_size: usize,
    ) -> Result<Vec<RecentComment>, CacheError> {
        self.retry
            .run("post_cache.prepend_comment", |_| {
                self.prepend_once(post_id, comment, max_size)
            })
            .await
    }

    async fn prepend_once(
        &self,
        post_id: PostId,
        comment: &RecentComment,
        max_size: usize,
    ) -> Result<Vec<RecentComment>, CacheError> {
        let key = CacheKey::Post(post_id).to_string();
        let snapshot = self.backend.watch(std::slice::from_ref(&key)).await?;
        let stored = self
            .backend
            .get_hash(&key)
            .await?
            .ok_or(CacheError::MissingRecord { post_id })?;
        let current = decode_comments(post_id, &stored.fields);
        let (commands, preview) = self.prepend_commands(post_id, current, comment, max_size)?;
        self.backend.commit(&snapshot, commands).await?;
        Ok(preview)
    }

    // ========================================================================
    // Command builders shared with the event applier
    // ========================================================================

    pub(crate) fn write_commands(&self, record: &PostCacheRecord) -> Result<Vec<Command>, CacheError> {
        record.validate(self.config.recent_comments)?;
        let key = CacheKey::Post(record.post_id).to_string();
        Ok(vec![
            Command::HashSetAll {
                key: key.clone(),
                fields: encode(record)?,
            },
            Command::Expire {
                key,
                ttl: self.config.post_ttl,
            },
        ])
    }

    pub(crate) fn increment_commands(
        &self,
        post_id: PostId,
        field: CounterField,
        delta: u32,
    ) -> Vec<Command> {
        let key = CacheKey::Post(post_id).to_string();
        vec![
            Command::HashIncrement {
                key: key.clone(),
                field: field.as_field().to_string(),
                delta: i64::from(delta),
            },
            Command::Expire {
                key,
                ttl: self.config.post_ttl,
            },
        ]
    }

    pub(crate) fn prepend_commands(
        &self,
        post_id: PostId,
        mut current: Vec<RecentComment>,
        comment: &RecentComment,
        max_size: usize,
    ) -> Result<(Vec<Command>, Vec<RecentComment>), CacheError> {
        current.insert(0, comment.clone());
        current.truncate(max_size);
        let key = CacheKey::Post(post_id).to_string();
        let commands = vec![
            Command::HashSet {
                key: key.clone(),
                field: fields::RECENT_COMMENTS.to_string(),
                value: serde_json::to_string(&current)?,
            },
            Command::HashIncrement {
                key: key.clone(),
                field: fields::COMMENT_COUNT.to_string(),
                delta: 1,
            },
            Command::Expire {
                key,
                ttl: self.config.post_ttl,
            },
        ];
        Ok((commands, current))
    }

    /// Decodes the comment preview. A malformed payload is logged and read
    /// as empty; the next successful write replaces it.
    pub(crate) fn read_comments(&self, post_id: PostId, map: &FieldMap) -> Vec<RecentComment> {
        decode_comments(post_id, map)
    }
}

fn first_integer(replies: &[Reply]) -> i64 {
    replies
        .iter()
        .find_map(|reply| match reply {
            Reply::Integer(value) => Some(*value),
            _ => None,
        })
        .unwrap_or_default()
}

// ============================================================================
// Field codec
// ============================================================================

fn encode(record: &PostCacheRecord) -> Result<FieldMap, CacheError> {
    let created_at = record
        .created_at
        .format(&Rfc3339)
        .map_err(|err| CacheError::Encode(err.to_string()))?;
    let recent_comments = serde_json::to_string(&record.recent_comments)?;

    Ok(FieldMap::from([
        (fields::POST_ID.to_string(), record.post_id.to_string()),
        (fields::AUTHOR_ID.to_string(), record.author_id.to_string()),
        (fields::CONTENT.to_string(), record.content.clone()),
        (fields::CREATED_AT.to_string(), created_at),
        (
            fields::COMMENT_COUNT.to_string(),
            record.comment_count.to_string(),
        ),
        (fields::LIKE_COUNT.to_string(), record.like_count.to_string()),
        (fields::VIEW_COUNT.to_string(), record.view_count.to_string()),
        (fields::RECENT_COMMENTS.to_string(), recent_comments),
    ]))
}

fn decode(post_id: PostId, stored: StoredHash) -> Result<PostCacheRecord, String> {
    let map = &stored.fields;
    let created_at = OffsetDateTime::parse(required(map, fields::CREATED_AT)?, &Rfc3339)
        .map_err(|err| format!("field `{}`: {err}", fields::CREATED_AT))?;

    Ok(PostCacheRecord {
        post_id,
        author_id: integer(map, fields::AUTHOR_ID)?,
        content: required(map, fields::CONTENT)?.to_string(),
        created_at,
        comment_count: integer(map, fields::COMMENT_COUNT)?,
        like_count: integer(map, fields::LIKE_COUNT)?,
        view_count: integer(map, fields::VIEW_COUNT)?,
        recent_comments: decode_comments(post_id, map),
        expires_in: stored.ttl,
    })
}

fn required<'a>(map: &'a FieldMap, name: &str) -> Result<&'a str, String> {
    map.get(name)
        .map(String::as_str)
        .ok_or_else(|| format!("missing field `{name}`"))
}

fn integer(map: &FieldMap, name: &str) -> Result<i64, String> {
    required(map, name)?
        .parse()
        .map_err(|err| format!("field `{name}`: {err}"))
}

fn decode_comments(post_id: PostId, map: &FieldMap) -> Vec<RecentComment> {
    let Some(raw) = map.get(fields::RECENT_COMMENTS) else {
        return Vec::new();
    };
    match serde_json::from_str(raw) {
        Ok(comments) => comments,
        Err(err) => {
            counter!(METRIC_POST_CACHE_DECODE_FAILURE).increment(1);
            warn!(
                target = "cache::post_store",
                post_id,
                error = %err,
                "Malformed recent comments payload, treating as empty"
            );
            Vec::new()
        }
    }
}
