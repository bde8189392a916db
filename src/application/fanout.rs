//! Fan-out on write: a published post lands in every follower's feed.

use metrics::counter;
use thiserror::Error;
use tracing::{info, instrument};

use crate::cache::{CacheError, FeedIndexStore};
use crate::domain::entities::{FeedEntry, PostId, epoch_millis};
use crate::domain::events::PublishEvent;

const METRIC_FANOUT_ENTRIES: &str = "feedline_fanout_entries_total";

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("fan-out of post {post_id} failed: {source}")]
    Store {
        post_id: PostId,
        #[source]
        source: CacheError,
    },
}

#[derive(Clone)]
pub struct FanoutWriter {
    feeds: FeedIndexStore,
}

impl FanoutWriter {
    pub fn new(feeds: FeedIndexStore) -> Self {
        Self { feeds }
    }

    /// Adds the post to every follower's feed in one batch and returns how
    /// many feeds were written. Re-adding an existing entry is a no-op, so
    /// redelivered publish events are harmless.
    #[instrument(skip(self, event), fields(post_id = event.post_id, followers = event.follower_ids.len()))]
    pub async fn publish(&self, event: &PublishEvent) -> Result<usize, FanoutError> {
        if event.follower_ids.is_empty() {
            return Ok(0);
        }

        let score = epoch_millis(event.published_at);
        let entries: Vec<FeedEntry> = event
            .follower_ids
            .iter()
            .map(|user_id| FeedEntry {
                user_id: *user_id,
                post_id: event.post_id,
                score,
            })
            .collect();

        self.feeds
            .add_to_feed(&entries)
            .await
            .map_err(|source| FanoutError::Store {
                post_id: event.post_id,
                source,
            })?;

        counter!(METRIC_FANOUT_ENTRIES).increment(entries.len() as u64);
        info!(
            target = "application::fanout",
            post_id = event.post_id,
            author_id = event.author_id,
            followers = entries.len(),
            "Fanned out published post"
        );
        Ok(entries.len())
    }
}
