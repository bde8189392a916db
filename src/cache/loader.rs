//! Builds post cache records from the canonical store.
//!
//! Cache-aside population, event seeding and batch heating all go through
//! [`CanonicalLoader::assemble`], so every path produces the same record for
//! the same canonical data.

use std::collections::HashMap;
use std::sync::Arc;

use crate::application::repos::{CanonicalStore, RepoError};
use crate::domain::entities::{PostCacheRecord, PostId, PostRecord, RecentComment};

use super::error::CacheError;

#[derive(Clone)]
pub struct CanonicalLoader {
    store: Arc<dyn CanonicalStore>,
    recent_comments: usize,
}

impl CanonicalLoader {
    pub fn new(store: Arc<dyn CanonicalStore>, recent_comments: usize) -> Self {
        Self {
            store,
            recent_comments,
        }
    }

    pub fn store(&self) -> &Arc<dyn CanonicalStore> {
        &self.store
    }

    /// Loads and assembles one post. A post the canonical store does not
    /// know surfaces as [`CacheError::PostNotFound`].
    pub async fn load(&self, post_id: PostId) -> Result<PostCacheRecord, CacheError> {
        let post = self
            .store
            .fetch_post(post_id)
            .await
            .map_err(CacheError::Canonical)?
            .ok_or(CacheError::PostNotFound { post_id })?;

        self.assemble(std::slice::from_ref(&post))
            .await
            .map_err(CacheError::Canonical)?
            .pop()
            .ok_or(CacheError::PostNotFound { post_id })
    }

    /// Assembles records for a batch with one aggregation query per kind.
    pub async fn assemble(&self, posts: &[PostRecord]) -> Result<Vec<PostCacheRecord>, RepoError> {
        if posts.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<PostId> = posts.iter().map(|post| post.id).collect();
        let (comment_counts, like_counts, mut recent) = tokio::try_join!(
            self.store.aggregate_comment_counts(&ids),
            self.store.aggregate_like_counts(&ids),
            self.store
                .fetch_top_k_recent_comments(&ids, self.recent_comments),
        )?;

        Ok(posts
            .iter()
            .map(|post| {
                let comments = recent
                    .remove(&post.id)
                    .unwrap_or_default()
                    .iter()
                    .map(RecentComment::from)
                    .collect();
                PostCacheRecord::assemble(
                    post,
                    count_for(&comment_counts, post.id),
                    count_for(&like_counts, post.id),
                    comments,
                    self.recent_comments,
                )
            })
            .collect())
    }
}

fn count_for(counts: &HashMap<PostId, i64>, post_id: PostId) -> i64 {
    counts.get(&post_id).copied().unwrap_or(0)
}
