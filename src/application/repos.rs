//! Repository traits describing persistence adapters.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::entities::{CommentRecord, PostId, PostRecord};
use crate::domain::types::JobType;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// One page of canonical posts ordered by publication time, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostPage {
    pub items: Vec<PostRecord>,
    pub has_next: bool,
}

/// Read-only view of the authoritative post store.
///
/// Aggregation methods take a whole batch of post ids and answer with one
/// query each. Posts without rows are simply missing from the returned map.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn fetch_post(&self, post_id: PostId) -> Result<Option<PostRecord>, RepoError>;

    /// Published, non-deleted posts with `from <= published_at <= to`.
    /// `page` is zero-based.
    async fn fetch_posts_in_range(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
        page: u32,
        batch_size: u32,
    ) -> Result<PostPage, RepoError>;

    async fn aggregate_comment_counts(
        &self,
        post_ids: &[PostId],
    ) -> Result<HashMap<PostId, i64>, RepoError>;

    async fn aggregate_like_counts(
        &self,
        post_ids: &[PostId],
    ) -> Result<HashMap<PostId, i64>, RepoError>;

    /// Up to `k` comments per post, newest first.
    async fn fetch_top_k_recent_comments(
        &self,
        post_ids: &[PostId],
        k: usize,
    ) -> Result<HashMap<PostId, Vec<CommentRecord>>, RepoError>;
}

#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub run_at: OffsetDateTime,
    pub max_attempts: i32,
    pub priority: i32,
}

/// Producer side of the job bus.
#[async_trait]
pub trait JobsRepo: Send + Sync {
    /// Pushes a pending job and returns its id.
    async fn enqueue_job(&self, job: NewJobRecord) -> Result<String, RepoError>;
}
