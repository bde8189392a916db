//! Domain entities: canonical rows and their cached projections.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::error::DomainError;

pub type PostId = i64;
pub type UserId = i64;

/// A published post as stored in the canonical store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    pub id: PostId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: OffsetDateTime,
    pub published_at: OffsetDateTime,
    pub view_count: i64,
}

/// A comment row as stored in the canonical store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentRecord {
    pub id: i64,
    pub post_id: PostId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: OffsetDateTime,
}

/// One entry of a cached post's newest-first comment preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentComment {
    pub author_id: UserId,
    pub content: String,
}

impl From<&CommentRecord> for RecentComment {
    fn from(comment: &CommentRecord) -> Self {
        Self {
            author_id: comment.author_id,
            content: comment.content.clone(),
        }
    }
}

/// Denormalized projection of a post kept in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostCacheRecord {
    pub post_id: PostId,
    pub author_id: UserId,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub comment_count: i64,
    pub like_count: i64,
    pub view_count: i64,
    /// Newest first, never longer than the configured preview size.
    pub recent_comments: Vec<RecentComment>,
    /// Remaining lifetime reported by the backing store. `None` for records
    /// that have not been written yet.
    #[serde(skip)]
    pub expires_in: Option<Duration>,
}

impl PostCacheRecord {
    /// Builds a fresh record from a canonical post and its aggregates.
    pub fn assemble(
        post: &PostRecord,
        comment_count: i64,
        like_count: i64,
        mut recent_comments: Vec<RecentComment>,
        max_comments: usize,
    ) -> Self {
        recent_comments.truncate(max_comments);
        Self {
            post_id: post.id,
            author_id: post.author_id,
            content: post.content.clone(),
            created_at: post.created_at,
            comment_count: comment_count.max(0),
            like_count: like_count.max(0),
            view_count: post.view_count.max(0),
            recent_comments,
            expires_in: None,
        }
    }

    pub fn validate(&self, max_comments: usize) -> Result<(), DomainError> {
        if self.comment_count < 0 || self.like_count < 0 || self.view_count < 0 {
            return Err(DomainError::invalid_record(
                self.post_id,
                "negative counter",
            ));
        }
        if self.recent_comments.len() > max_comments {
            return Err(DomainError::invalid_record(
                self.post_id,
                format!(
                    "{} recent comments, limit is {max_comments}",
                    self.recent_comments.len()
                ),
            ));
        }
        Ok(())
    }
}

/// Membership of one post in one user's ranked feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedEntry {
    pub user_id: UserId,
    pub post_id: PostId,
    /// Publication instant in epoch milliseconds. Ordering only.
    pub score: i64,
}

/// Announcement emitted once heating has cached a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostReadiness {
    pub post_id: PostId,
    pub author_id: UserId,
    pub comment_author_ids: Vec<UserId>,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub heated_at: OffsetDateTime,
}

/// Converts an instant into the epoch-millisecond score used by feeds.
pub fn epoch_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}
