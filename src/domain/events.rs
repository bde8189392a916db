//! Domain events delivered by the message bus.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::entities::{PostId, UserId};

/// Kinds of events the engine consumes, one worker pool each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Publish,
    Like,
    View,
    Comment,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Publish,
        EventKind::Like,
        EventKind::View,
        EventKind::Comment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Publish => "publish",
            EventKind::Like => "like",
            EventKind::View => "view",
            EventKind::Comment => "comment",
        }
    }
}

impl TryFrom<&str> for EventKind {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "publish" => Ok(EventKind::Publish),
            "like" => Ok(EventKind::Like),
            "view" => Ok(EventKind::View),
            "comment" => Ok(EventKind::Comment),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishEvent {
    pub post_id: PostId,
    pub author_id: UserId,
    pub follower_ids: Vec<UserId>,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeEvent {
    pub post_id: PostId,
    pub like_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEvent {
    pub post_id: PostId,
    pub viewer_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub viewed_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentEvent {
    pub post_id: PostId,
    pub comment_id: i64,
    pub author_id: UserId,
    pub content: String,
}

/// Every event the engine understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Publish(PublishEvent),
    Like(LikeEvent),
    View(ViewEvent),
    Comment(CommentEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Publish(_) => EventKind::Publish,
            Event::Like(_) => EventKind::Like,
            Event::View(_) => EventKind::View,
            Event::Comment(_) => EventKind::Comment,
        }
    }

    pub fn post_id(&self) -> PostId {
        match self {
            Event::Publish(event) => event.post_id,
            Event::Like(event) => event.post_id,
            Event::View(event) => event.post_id,
            Event::Comment(event) => event.post_id,
        }
    }
}
