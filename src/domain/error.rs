use thiserror::Error;

use super::entities::PostId;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("cache record for post {post_id} is invalid: {message}")]
    InvalidRecord { post_id: PostId, message: String },
    #[error("invalid heating schedule `{expression}`: {reason}")]
    InvalidSchedule { expression: String, reason: String },
}

impl DomainError {
    pub fn invalid_record(post_id: PostId, message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            post_id,
            message: message.into(),
        }
    }

    pub fn invalid_schedule(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}
