//! Readiness announcements as jobs on the `post_readiness` queue.

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    application::{
        announce::{AnnounceError, Announcer},
        repos::{JobsRepo, NewJobRecord},
    },
    domain::{entities::PostReadiness, types::JobType},
};

const READINESS_PRIORITY: i32 = 0;

/// Announces heated posts on the `post_readiness` queue.
#[derive(Clone)]
pub struct QueueAnnouncer {
    jobs: Arc<dyn JobsRepo>,
    max_attempts: i32,
}

impl QueueAnnouncer {
    pub fn new(jobs: Arc<dyn JobsRepo>, max_attempts: i32) -> Self {
        Self { jobs, max_attempts }
    }
}

#[async_trait]
impl Announcer for QueueAnnouncer {
    async fn announce(&self, readiness: &PostReadiness) -> Result<(), AnnounceError> {
        let post_id = readiness.post_id;
        let payload = serde_json::to_value(readiness)
            .map_err(|err| AnnounceError::new(post_id, err.to_string()))?;

        let job_id = self
            .jobs
            .enqueue_job(NewJobRecord {
                job_type: JobType::PostReadiness,
                payload,
                run_at: OffsetDateTime::now_utc(),
                max_attempts: self.max_attempts,
                priority: READINESS_PRIORITY,
            })
            .await
            .map_err(|err| AnnounceError::new(post_id, err.to_string()))?;

        debug!(
            target = "application::jobs::readiness",
            post_id,
            job_id = %job_id,
            "Queued post readiness announcement"
        );
        Ok(())
    }
}
