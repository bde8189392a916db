#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use feedline::application::announce::{AnnounceError, Announcer};
use feedline::application::engine::Engine;
use feedline::application::heating::HeatingConfig;
use feedline::application::repos::{CanonicalStore, PostPage, RepoError};
use feedline::cache::{
    BackendError, CacheBackend, CacheConfig, Command, MemoryBackend, Reply, StoredHash,
    WatchSnapshot,
};
use feedline::domain::entities::{CommentRecord, PostId, PostReadiness, PostRecord, UserId};
use time::OffsetDateTime;

pub fn at_millis(millis: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::from_millis(millis as u64)
}

pub fn post(id: PostId, author_id: UserId, content: &str, published_ms: i64) -> PostRecord {
    PostRecord {
        id,
        author_id,
        content: content.to_string(),
        created_at: at_millis(published_ms),
        published_at: at_millis(published_ms),
        view_count: 0,
    }
}

// ============================================================================
// Canonical store
// ============================================================================

#[derive(Default)]
struct CanonicalData {
    posts: HashMap<PostId, PostRecord>,
    comments: Vec<CommentRecord>,
    likes: HashMap<PostId, i64>,
}

/// Canonical store held in memory, counting the calls made against it.
#[derive(Default)]
pub struct InMemoryCanonical {
    data: Mutex<CanonicalData>,
    pub fetch_post_calls: AtomicUsize,
    pub range_calls: AtomicUsize,
    pub aggregate_calls: AtomicUsize,
    /// Every range query fails while set.
    pub fail_range: AtomicBool,
    /// Aggregations fail for this many further calls.
    pub fail_aggregations: AtomicUsize,
    /// Range queries sleep this long before answering.
    pub range_delay: Mutex<Option<Duration>>,
}

impl InMemoryCanonical {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_post(&self, post: PostRecord) {
        self.data.lock().unwrap().posts.insert(post.id, post);
    }

    pub fn insert_comment(&self, id: i64, post_id: PostId, author_id: UserId, content: &str, at_ms: i64) {
        self.data.lock().unwrap().comments.push(CommentRecord {
            id,
            post_id,
            author_id,
            content: content.to_string(),
            created_at: at_millis(at_ms),
        });
    }

    pub fn set_likes(&self, post_id: PostId, likes: i64) {
        self.data.lock().unwrap().likes.insert(post_id, likes);
    }

    pub fn fetch_post_calls(&self) -> usize {
        self.fetch_post_calls.load(Ordering::SeqCst)
    }

    fn check_aggregation(&self) -> Result<(), RepoError> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_aggregations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RepoError::from_persistence("aggregation unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl CanonicalStore for InMemoryCanonical {
    async fn fetch_post(&self, post_id: PostId) -> Result<Option<PostRecord>, RepoError> {
        self.fetch_post_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.data.lock().unwrap().posts.get(&post_id).cloned())
    }

    async fn fetch_posts_in_range(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
        page: u32,
        batch_size: u32,
    ) -> Result<PostPage, RepoError> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.range_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_range.load(Ordering::SeqCst) {
            return Err(RepoError::Timeout);
        }

        let mut posts: Vec<PostRecord> = self
            .data
            .lock()
            .unwrap()
            .posts
            .values()
            .filter(|post| post.published_at >= from && post.published_at <= to)
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.published_at.cmp(&a.published_at).then(b.id.cmp(&a.id)));

        let start = page as usize * batch_size as usize;
        let items: Vec<PostRecord> = posts
            .iter()
            .skip(start)
            .take(batch_size as usize)
            .cloned()
            .collect();
        let has_next = posts.len() > start + items.len();
        Ok(PostPage { items, has_next })
    }

    async fn aggregate_comment_counts(
        &self,
        post_ids: &[PostId],
    ) -> Result<HashMap<PostId, i64>, RepoError> {
        self.check_aggregation()?;
        let data = self.data.lock().unwrap();
        let mut counts = HashMap::new();
        for comment in &data.comments {
            if post_ids.contains(&comment.post_id) {
                *counts.entry(comment.post_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn aggregate_like_counts(
        &self,
        post_ids: &[PostId],
    ) -> Result<HashMap<PostId, i64>, RepoError> {
        self.check_aggregation()?;
        let data = self.data.lock().unwrap();
        Ok(post_ids
            .iter()
            .filter_map(|id| data.likes.get(id).map(|likes| (*id, *likes)))
            .collect())
    }

    async fn fetch_top_k_recent_comments(
        &self,
        post_ids: &[PostId],
        k: usize,
    ) -> Result<HashMap<PostId, Vec<CommentRecord>>, RepoError> {
        self.check_aggregation()?;
        let data = self.data.lock().unwrap();
        let mut grouped: HashMap<PostId, Vec<CommentRecord>> = HashMap::new();
        for comment in &data.comments {
            if post_ids.contains(&comment.post_id) {
                grouped.entry(comment.post_id).or_default().push(comment.clone());
            }
        }
        for comments in grouped.values_mut() {
            comments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            comments.truncate(k);
        }
        Ok(grouped)
    }
}

// ============================================================================
// Cache backend with injected failures
// ============================================================================

/// Wraps [`MemoryBackend`] and fails a chosen number of upcoming reads or
/// writes.
#[derive(Default)]
pub struct FlakyBackend {
    pub inner: MemoryBackend,
    fail_reads: AtomicUsize,
    fail_commits: AtomicUsize,
    fail_pipelines: AtomicUsize,
    pub read_calls: AtomicUsize,
    pub commit_calls: AtomicUsize,
}

impl FlakyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_reads(&self, count: usize) {
        self.fail_reads.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_pipelines(&self, count: usize) {
        self.fail_pipelines.store(count, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn read(&self) -> Result<(), BackendError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.fail_reads) {
            return Err(BackendError::unavailable("injected read failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    async fn get_hash(&self, key: &str) -> Result<Option<StoredHash>, BackendError> {
        self.read()?;
        self.inner.get_hash(key).await
    }

    async fn get_hashes(&self, keys: &[String]) -> Result<Vec<Option<StoredHash>>, BackendError> {
        self.read()?;
        self.inner.get_hashes(keys).await
    }

    async fn range_desc(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, BackendError> {
        self.read()?;
        self.inner.range_desc(key, offset, limit).await
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        self.inner.set_if_absent(key, ttl).await
    }

    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>, BackendError> {
        if Self::take(&self.fail_pipelines) {
            return Err(BackendError::unavailable("injected pipeline failure"));
        }
        self.inner.pipeline(commands).await
    }

    async fn watch(&self, keys: &[String]) -> Result<WatchSnapshot, BackendError> {
        self.inner.watch(keys).await
    }

    async fn commit(
        &self,
        snapshot: &WatchSnapshot,
        commands: Vec<Command>,
    ) -> Result<Vec<Reply>, BackendError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.fail_commits) {
            return Err(BackendError::unavailable("injected commit failure"));
        }
        self.inner.commit(snapshot, commands).await
    }
}

// ============================================================================
// Announcer
// ============================================================================

#[derive(Default)]
pub struct RecordingAnnouncer {
    pub announced: Mutex<Vec<PostReadiness>>,
    pub reject: Mutex<Vec<PostId>>,
}

impl RecordingAnnouncer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn announced_ids(&self) -> Vec<PostId> {
        self.announced
            .lock()
            .unwrap()
            .iter()
            .map(|readiness| readiness.post_id)
            .collect()
    }
}

#[async_trait]
impl Announcer for RecordingAnnouncer {
    async fn announce(&self, readiness: &PostReadiness) -> Result<(), AnnounceError> {
        if self.reject.lock().unwrap().contains(&readiness.post_id) {
            return Err(AnnounceError::new(readiness.post_id, "queue refused"));
        }
        self.announced.lock().unwrap().push(readiness.clone());
        Ok(())
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub fn engine(backend: Arc<dyn CacheBackend>, canonical: Arc<InMemoryCanonical>) -> Engine {
    engine_with(backend, canonical, None, CacheConfig::default())
}

pub fn engine_with(
    backend: Arc<dyn CacheBackend>,
    canonical: Arc<InMemoryCanonical>,
    announcer: Option<Arc<dyn Announcer>>,
    config: CacheConfig,
) -> Engine {
    Engine::assemble(
        backend,
        canonical,
        announcer,
        config,
        HeatingConfig::default(),
    )
}

/// Polls the heating flag until the active run, if any, has finished.
pub async fn wait_until_idle(engine: &Engine) {
    while engine.heating.is_running() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
