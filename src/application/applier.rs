//! Idempotent application of engagement events to cached posts.
//!
//! Every like, view and comment runs the same protocol in one watched
//! transaction:
//!
//! 1. watch the event's marker and the post record
//! 2. a present marker means the event was applied already: succeed quietly
//! 3. seed the record from the canonical store when it is not cached
//! 4. commit marker, seed and mutation together
//!
//! A conflicting writer or a transient backend failure restarts the
//! protocol within the retry budget. Nothing is left behind by a failed
//! attempt, so the bus can redeliver safely.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::time::{Instant, timeout};
use tracing::{debug, instrument};

use crate::application::repos::RepoError;
use crate::cache::{
    CacheBackend, CacheConfig, CacheError, CacheKey, CounterField, IdempotencyGuard,
    PostCacheStore, RetryPolicy,
};
use crate::domain::entities::{PostId, RecentComment};
use crate::domain::events::{CommentEvent, EventKind, LikeEvent, ViewEvent};

const METRIC_EVENT_APPLIED: &str = "feedline_event_applied_total";
const METRIC_EVENT_APPLY_MS: &str = "feedline_event_apply_ms";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Committed,
    /// The event's marker was already present; nothing changed.
    Duplicate,
}

impl ApplyOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyOutcome::Committed => "committed",
            ApplyOutcome::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("cache store unavailable after retries: {0}")]
    Transient(#[source] CacheError),
    #[error("post {post_id} does not exist in the canonical store")]
    PostNotFound { post_id: PostId },
    #[error("canonical lookup for post {post_id} failed: {source}")]
    CanonicalLookup {
        post_id: PostId,
        #[source]
        source: RepoError,
    },
    #[error("applying {kind} event timed out after {timeout:?}")]
    Timeout {
        kind: &'static str,
        timeout: Duration,
    },
    #[error(transparent)]
    Cache(CacheError),
}

impl ApplyError {
    fn from_cache(post_id: PostId, err: CacheError) -> Self {
        match err {
            CacheError::Backend(backend) if backend.is_transient() => {
                Self::Transient(CacheError::Backend(backend))
            }
            CacheError::PostNotFound { post_id } => Self::PostNotFound { post_id },
            CacheError::Canonical(source) => Self::CanonicalLookup { post_id, source },
            other => Self::Cache(other),
        }
    }
}

/// How an event changes the cached post.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mutation {
    Increment(CounterField),
    PrependComment(RecentComment),
}

#[derive(Debug, Clone)]
struct Engagement {
    kind: EventKind,
    post_id: PostId,
    marker: CacheKey,
    marker_ttl: Duration,
    mutation: Mutation,
}

#[derive(Clone)]
pub struct EventApplier {
    backend: Arc<dyn CacheBackend>,
    posts: PostCacheStore,
    guard: IdempotencyGuard,
    config: CacheConfig,
    retry: RetryPolicy,
}

impl EventApplier {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        posts: PostCacheStore,
        guard: IdempotencyGuard,
    ) -> Self {
        let config = posts.config().clone();
        let retry = RetryPolicy::from_config(&config);
        Self {
            backend,
            posts,
            guard,
            config,
            retry,
        }
    }

    pub async fn apply_like(&self, event: &LikeEvent) -> Result<ApplyOutcome, ApplyError> {
        self.apply(Engagement {
            kind: EventKind::Like,
            post_id: event.post_id,
            marker: CacheKey::like(event),
            marker_ttl: self.config.like_marker_ttl,
            mutation: Mutation::Increment(CounterField::Likes),
        })
        .await
    }

    pub async fn apply_view(&self, event: &ViewEvent) -> Result<ApplyOutcome, ApplyError> {
        self.apply(Engagement {
            kind: EventKind::View,
            post_id: event.post_id,
            marker: CacheKey::view(event),
            marker_ttl: self.config.view_marker_ttl,
            mutation: Mutation::Increment(CounterField::Views),
        })
        .await
    }

    pub async fn apply_comment(&self, event: &CommentEvent) -> Result<ApplyOutcome, ApplyError> {
        self.apply(Engagement {
            kind: EventKind::Comment,
            post_id: event.post_id,
            marker: CacheKey::comment(event),
            marker_ttl: self.config.comment_marker_ttl,
            mutation: Mutation::PrependComment(RecentComment {
                author_id: event.author_id,
                content: event.content.clone(),
            }),
        })
        .await
    }

    #[instrument(skip(self, engagement), fields(kind = engagement.kind.as_str(), post_id = engagement.post_id, marker = %engagement.marker))]
    async fn apply(&self, engagement: Engagement) -> Result<ApplyOutcome, ApplyError> {
        let started = Instant::now();
        let kind = engagement.kind.as_str();

        let attempts = self
            .retry
            .run("applier.apply", |_| self.attempt(&engagement));
        let result = match timeout(self.config.apply_timeout, attempts).await {
            Ok(result) => result.map_err(|err| ApplyError::from_cache(engagement.post_id, err)),
            Err(_) => Err(ApplyError::Timeout {
                kind,
                timeout: self.config.apply_timeout,
            }),
        };

        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(_) => "failed",
        };
        counter!(METRIC_EVENT_APPLIED, "kind" => kind, "outcome" => outcome).increment(1);
        histogram!(METRIC_EVENT_APPLY_MS, "kind" => kind)
            .record(started.elapsed().as_secs_f64() * 1000.0);

        if let Ok(ApplyOutcome::Duplicate) = result {
            debug!(
                target = "application::applier",
                "Duplicate delivery suppressed by idempotency marker"
            );
        }
        result
    }

    async fn attempt(&self, engagement: &Engagement) -> Result<ApplyOutcome, CacheError> {
        let post_id = engagement.post_id;
        let marker_key = engagement.marker.to_string();
        let post_key = CacheKey::Post(post_id).to_string();

        let snapshot = self
            .backend
            .watch(&[marker_key, post_key.clone()])
            .await?;
        if self.guard.is_claimed(&snapshot, &engagement.marker) {
            return Ok(ApplyOutcome::Duplicate);
        }

        let mut commands = vec![
            self.guard
                .claim_command(&engagement.marker, engagement.marker_ttl),
        ];

        // Seeded records already carry the canonical counts; the mutation
        // is still applied on top of them.
        let current_comments = if snapshot.exists(&post_key) {
            match engagement.mutation {
                Mutation::PrependComment(_) => self
                    .backend
                    .get_hash(&post_key)
                    .await?
                    .map(|stored| self.posts.read_comments(post_id, &stored.fields))
                    .unwrap_or_default(),
                Mutation::Increment(_) => Vec::new(),
            }
        } else {
            let seed = self.posts.loader().load(post_id).await?;
            commands.extend(self.posts.write_commands(&seed)?);
            debug!(
                target = "application::applier",
                post_id, "Seeded missing post record from canonical store"
            );
            seed.recent_comments
        };

        match &engagement.mutation {
            Mutation::Increment(field) => {
                commands.extend(self.posts.increment_commands(post_id, *field, 1));
            }
            Mutation::PrependComment(comment) => {
                let (prepend, _) = self.posts.prepend_commands(
                    post_id,
                    current_comments,
                    comment,
                    self.config.recent_comments,
                )?;
                commands.extend(prepend);
            }
        }

        self.backend.commit(&snapshot, commands).await?;
        Ok(ApplyOutcome::Committed)
    }
}
