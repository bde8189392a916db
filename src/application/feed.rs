//! Read-side operations offered to the REST collaborator.

use std::sync::Arc;

use thiserror::Error;
use tracing::{instrument, warn};

use crate::application::heating::{HeatingController, TriggerOutcome};
use crate::cache::{CacheError, FeedIndexStore, PostCacheStore};
use crate::domain::entities::{PostCacheRecord, PostId, UserId};

pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("page size must be between 1 and 100, got {0}")]
    InvalidPageSize(usize),
    #[error("post {post_id} not found")]
    PostNotFound { post_id: PostId },
    #[error(transparent)]
    Cache(CacheError),
}

impl From<CacheError> for FeedError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::PostNotFound { post_id } => Self::PostNotFound { post_id },
            other => Self::Cache(other),
        }
    }
}

#[derive(Clone)]
pub struct FeedService {
    feeds: FeedIndexStore,
    posts: PostCacheStore,
    heating: Arc<HeatingController>,
}

impl FeedService {
    pub fn new(
        feeds: FeedIndexStore,
        posts: PostCacheStore,
        heating: Arc<HeatingController>,
    ) -> Self {
        Self {
            feeds,
            posts,
            heating,
        }
    }

    /// One page of a user's feed, newest first. Posts whose cache record is
    /// gone are left out, or populated first when configured to do so.
    #[instrument(skip(self))]
    pub async fn feed_page(
        &self,
        user_id: UserId,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<PostCacheRecord>, FeedError> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(FeedError::InvalidPageSize(page_size));
        }

        let post_ids = self.feeds.read_page(user_id, page, page_size).await?;
        if post_ids.is_empty() {
            return Ok(Vec::new());
        }

        let cached = self.posts.cached_many(&post_ids).await?;
        let populate = self.posts.config().populate_missing_on_read;
        let mut records = Vec::with_capacity(post_ids.len());
        for (post_id, record) in post_ids.into_iter().zip(cached) {
            match record {
                Some(record) => records.push(record),
                None if populate => match self.posts.get(post_id).await {
                    Ok(record) => records.push(record),
                    Err(err) => warn!(
                        target = "application::feed",
                        user_id,
                        post_id,
                        error = %err,
                        "Omitting feed entry that could not be populated"
                    ),
                },
                None => {}
            }
        }
        Ok(records)
    }

    /// Cache-aside read of one post; unknown posts surface as not found.
    pub async fn post(&self, post_id: PostId) -> Result<PostCacheRecord, FeedError> {
        Ok(self.posts.get(post_id).await?)
    }

    pub fn trigger_heating(&self) -> TriggerOutcome {
        self.heating.trigger()
    }
}
