//! Bounded per-user feed index.
//!
//! Each user owns a ranked set of post ids scored by publication time in
//! epoch milliseconds. After every insert the set is trimmed back to the
//! configured size, dropping the lowest scores first.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::domain::entities::{FeedEntry, PostId, UserId};

use super::backend::{CacheBackend, Command, Reply};
use super::error::CacheError;
use super::keys::CacheKey;
use super::retry::RetryPolicy;

const METRIC_FEED_TRIMMED: &str = "feedline_feed_trimmed_total";

#[derive(Clone)]
pub struct FeedIndexStore {
    backend: Arc<dyn CacheBackend>,
    feed_size: usize,
    retry: RetryPolicy,
}

impl FeedIndexStore {
    pub fn new(backend: Arc<dyn CacheBackend>, feed_size: usize, retry: RetryPolicy) -> Self {
        Self {
            backend,
            feed_size,
            retry,
        }
    }

    /// Inserts every entry and trims each touched feed, in one pipelined
    /// round trip. The batch is applied entirely or not at all, and is
    /// retried wholesale on transient failures.
    pub async fn add_to_feed(&self, entries: &[FeedEntry]) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut commands = Vec::with_capacity(entries.len() * 2);
        for entry in entries {
            let key = CacheKey::Feed(entry.user_id).to_string();
            commands.push(Command::SortedAdd {
                key: key.clone(),
                member: entry.post_id.to_string(),
                score: entry.score,
            });
            commands.push(Command::SortedTrim {
                key,
                keep: self.feed_size,
            });
        }

        let replies = self
            .retry
            .run("feed_index.add_to_feed", |_| {
                self.backend.pipeline(commands.clone())
            })
            .await?;

        let trimmed: usize = replies
            .iter()
            .map(|reply| match reply {
                Reply::Removed(count) => *count,
                _ => 0,
            })
            .sum();
        if trimmed > 0 {
            counter!(METRIC_FEED_TRIMMED).increment(trimmed as u64);
            debug!(
                target = "cache::feed_index",
                entries = entries.len(),
                trimmed,
                "Evicted lowest-score feed entries"
            );
        }
        Ok(())
    }

    /// Post ids for `[page * page_size, page * page_size + page_size)`,
    /// highest score first. Empty for unknown users or pages past the end.
    pub async fn read_page(
        &self,
        user_id: UserId,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<PostId>, CacheError> {
        if page_size == 0 {
            return Ok(Vec::new());
        }
        let Some(offset) = page.checked_mul(page_size) else {
            return Ok(Vec::new());
        };

        let key = CacheKey::Feed(user_id).to_string();
        let members = self.backend.range_desc(&key, offset, page_size).await?;

        Ok(members
            .into_iter()
            .filter_map(|member| match member.parse::<PostId>() {
                Ok(post_id) => Some(post_id),
                Err(_) => {
                    warn!(
                        target = "cache::feed_index",
                        user_id,
                        member = %member,
                        "Skipping non-numeric feed member"
                    );
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryBackend;

    fn store(feed_size: usize) -> FeedIndexStore {
        FeedIndexStore::new(
            Arc::new(MemoryBackend::new()),
            feed_size,
            RetryPolicy::default(),
        )
    }

    fn entry(user_id: UserId, post_id: PostId, score: i64) -> FeedEntry {
        FeedEntry {
            user_id,
            post_id,
            score,
        }
    }

    #[tokio::test]
    async fn pages_are_windows_over_descending_scores() {
        let feeds = store(10);
        let entries: Vec<FeedEntry> = (1..=5).map(|i| entry(1, i, i * 100)).collect();
        feeds.add_to_feed(&entries).await.expect("add");

        assert_eq!(feeds.read_page(1, 0, 2).await.expect("page 0"), vec![5, 4]);
        assert_eq!(feeds.read_page(1, 1, 2).await.expect("page 1"), vec![3, 2]);
        assert_eq!(feeds.read_page(1, 2, 2).await.expect("page 2"), vec![1]);
        assert!(feeds.read_page(1, 3, 2).await.expect("past end").is_empty());
        assert!(feeds.read_page(2, 0, 2).await.expect("unknown").is_empty());
    }

    #[tokio::test]
    async fn feed_never_exceeds_configured_size() {
        let feeds = store(3);
        for i in 0..20 {
            feeds
                .add_to_feed(&[entry(1, i, i * 37 % 11)])
                .await
                .expect("add");
        }

        let all = feeds.read_page(1, 0, 100).await.expect("read");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn lower_score_insert_into_full_feed_is_evicted_immediately() {
        let feeds = store(2);
        feeds
            .add_to_feed(&[entry(1, 10, 500), entry(1, 11, 600)])
            .await
            .expect("fill");
        feeds.add_to_feed(&[entry(1, 12, 100)]).await.expect("late");

        assert_eq!(feeds.read_page(1, 0, 10).await.expect("read"), vec![11, 10]);
    }
}
