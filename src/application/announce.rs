//! Readiness announcements emitted by cache heating.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::{PostId, PostReadiness};

#[derive(Debug, Error)]
#[error("failed to announce readiness of post {post_id}: {message}")]
pub struct AnnounceError {
    pub post_id: PostId,
    pub message: String,
}

impl AnnounceError {
    pub fn new(post_id: PostId, message: impl Into<String>) -> Self {
        Self {
            post_id,
            message: message.into(),
        }
    }
}

/// Publishes "post is cached" notices for downstream fan-out.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, readiness: &PostReadiness) -> Result<(), AnnounceError>;
}
