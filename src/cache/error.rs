use thiserror::Error;

use crate::application::repos::RepoError;
use crate::domain::entities::PostId;
use crate::domain::error::DomainError;

use super::backend::BackendError;
use super::retry::Transient;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("post {post_id} is not cached")]
    MissingRecord { post_id: PostId },
    #[error("post {post_id} does not exist in the canonical store")]
    PostNotFound { post_id: PostId },
    #[error("canonical lookup failed: {0}")]
    Canonical(#[source] RepoError),
    #[error("failed to encode cached post: {0}")]
    Encode(String),
    #[error(transparent)]
    Invalid(#[from] DomainError),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl Transient for CacheError {
    fn is_transient(&self) -> bool {
        matches!(self, CacheError::Backend(err) if err.is_transient())
    }
}

impl Transient for BackendError {
    fn is_transient(&self) -> bool {
        BackendError::is_transient(self)
    }
}
