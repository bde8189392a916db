//! Cache key layout.
//!
//! | key                                             | value            |
//! |-------------------------------------------------|------------------|
//! | `newsfeed:user:{user}`                          | ranked set       |
//! | `post:{post}`                                   | hash with TTL    |
//! | `like:{like}`                                   | marker with TTL  |
//! | `comment:{comment}`                             | marker with TTL  |
//! | `postView:post:{post}:user:{viewer}:viewDateTime:{millis}` | marker with TTL |

use std::fmt;

use crate::domain::entities::{PostId, UserId, epoch_millis};
use crate::domain::events::{CommentEvent, LikeEvent, ViewEvent};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Feed(UserId),
    Post(PostId),
    LikeMarker(i64),
    CommentMarker(i64),
    ViewMarker {
        post_id: PostId,
        viewer_id: UserId,
        viewed_at_millis: i64,
    },
}

impl CacheKey {
    pub fn like(event: &LikeEvent) -> Self {
        CacheKey::LikeMarker(event.like_id)
    }

    pub fn comment(event: &CommentEvent) -> Self {
        CacheKey::CommentMarker(event.comment_id)
    }

    pub fn view(event: &ViewEvent) -> Self {
        CacheKey::ViewMarker {
            post_id: event.post_id,
            viewer_id: event.viewer_id,
            viewed_at_millis: epoch_millis(event.viewed_at),
        }
    }

    /// Whether this key is an idempotency marker.
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            CacheKey::LikeMarker(_) | CacheKey::CommentMarker(_) | CacheKey::ViewMarker { .. }
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Feed(user_id) => write!(f, "newsfeed:user:{user_id}"),
            CacheKey::Post(post_id) => write!(f, "post:{post_id}"),
            CacheKey::LikeMarker(like_id) => write!(f, "like:{like_id}"),
            CacheKey::CommentMarker(comment_id) => write!(f, "comment:{comment_id}"),
            CacheKey::ViewMarker {
                post_id,
                viewer_id,
                viewed_at_millis,
            } => write!(
                f,
                "postView:post:{post_id}:user:{viewer_id}:viewDateTime:{viewed_at_millis}"
            ),
        }
    }
}
