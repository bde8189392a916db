use serde::{Deserialize, Serialize};

use super::events::EventKind;

/// Queues on the job bus. The string form is the apalis namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    PublishEvent,
    LikeEvent,
    ViewEvent,
    CommentEvent,
    PostReadiness,
    HeatRequest,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::PublishEvent => "publish_event",
            JobType::LikeEvent => "like_event",
            JobType::ViewEvent => "view_event",
            JobType::CommentEvent => "comment_event",
            JobType::PostReadiness => "post_readiness",
            JobType::HeatRequest => "heat_request",
        }
    }
}

impl From<EventKind> for JobType {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Publish => JobType::PublishEvent,
            EventKind::Like => JobType::LikeEvent,
            EventKind::View => JobType::ViewEvent,
            EventKind::Comment => JobType::CommentEvent,
        }
    }
}

impl TryFrom<&str> for JobType {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "publish_event" => Ok(JobType::PublishEvent),
            "like_event" => Ok(JobType::LikeEvent),
            "view_event" => Ok(JobType::ViewEvent),
            "comment_event" => Ok(JobType::CommentEvent),
            "post_readiness" => Ok(JobType::PostReadiness),
            "heat_request" => Ok(JobType::HeatRequest),
            _ => Err(()),
        }
    }
}
