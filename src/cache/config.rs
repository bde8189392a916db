//! Cache configuration.
//!
//! Sizes, lifetimes and the retry budget shared by every cache writer.
//! Loaded from the `[cache]` section of the settings file.

use std::time::Duration;

const DEFAULT_FEED_SIZE: usize = 500;
const DEFAULT_RECENT_COMMENTS: usize = 3;
const DEFAULT_POST_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_MARKER_TTL: Duration = Duration::from_secs(12 * 60 * 60);
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Time one backend round trip may take inside an apply budget.
const ATTEMPT_ALLOWANCE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum entries kept in one user's feed.
    pub feed_size: usize,
    /// Length of the newest-first comment preview on a cached post.
    pub recent_comments: usize,
    /// Lifetime refreshed on every write to a post record.
    pub post_ttl: Duration,
    pub like_marker_ttl: Duration,
    pub view_marker_ttl: Duration,
    pub comment_marker_ttl: Duration,
    /// Attempts per cache operation, including the first one.
    pub retry_attempts: u32,
    /// First backoff delay; doubles after every failed attempt.
    pub retry_initial_backoff: Duration,
    /// Upper bound for applying one event end to end. Defaults to
    /// [`apply_timeout_for`] the retry settings.
    pub apply_timeout: Duration,
    /// Populate absent post records while assembling a feed page.
    pub populate_missing_on_read: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            feed_size: DEFAULT_FEED_SIZE,
            recent_comments: DEFAULT_RECENT_COMMENTS,
            post_ttl: DEFAULT_POST_TTL,
            like_marker_ttl: DEFAULT_MARKER_TTL,
            view_marker_ttl: DEFAULT_MARKER_TTL,
            comment_marker_ttl: DEFAULT_MARKER_TTL,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_initial_backoff: DEFAULT_RETRY_INITIAL_BACKOFF,
            apply_timeout: apply_timeout_for(
                DEFAULT_RETRY_ATTEMPTS,
                DEFAULT_RETRY_INITIAL_BACKOFF,
            ),
            populate_missing_on_read: false,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            feed_size: settings.feed_size.get() as usize,
            recent_comments: settings.recent_comments.get() as usize,
            post_ttl: settings.post_ttl,
            like_marker_ttl: settings.like_marker_ttl,
            view_marker_ttl: settings.view_marker_ttl,
            comment_marker_ttl: settings.comment_marker_ttl,
            retry_attempts: settings.retry_attempts.get(),
            retry_initial_backoff: settings.retry_initial_backoff,
            apply_timeout: settings.apply_timeout,
            populate_missing_on_read: settings.populate_missing_on_read,
        }
    }
}

/// Apply budget covering every retry attempt and the backoff sleeps
/// between them.
pub fn apply_timeout_for(attempts: u32, initial_backoff: Duration) -> Duration {
    let attempts = attempts.max(1);
    // Sleeps double: initial * (1 + 2 + ... + 2^(n-2)).
    let backoff_units = 2u32.saturating_pow(attempts - 1) - 1;
    initial_backoff
        .saturating_mul(backoff_units)
        .saturating_add(ATTEMPT_ALLOWANCE.saturating_mul(attempts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.feed_size, 500);
        assert_eq!(config.recent_comments, 3);
        assert_eq!(config.post_ttl, Duration::from_secs(86_400));
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_initial_backoff, Duration::from_millis(100));
        assert_eq!(config.apply_timeout, Duration::from_millis(1_050));
        assert!(!config.populate_missing_on_read);
    }

    #[test]
    fn apply_timeout_tracks_the_retry_budget() {
        assert_eq!(
            apply_timeout_for(1, Duration::from_millis(100)),
            Duration::from_millis(250)
        );
        // 100 + 200 + 400 of backoff, four round trips.
        assert_eq!(
            apply_timeout_for(4, Duration::from_millis(100)),
            Duration::from_millis(1_700)
        );
        assert_eq!(
            apply_timeout_for(0, Duration::from_millis(100)),
            apply_timeout_for(1, Duration::from_millis(100))
        );
        // Saturates instead of overflowing.
        assert!(
            apply_timeout_for(64, Duration::from_secs(1))
                >= Duration::from_secs(u64::from(u32::MAX - 1))
        );
    }

    #[test]
    fn markers_expire_before_posts() {
        let config = CacheConfig::default();
        assert!(config.like_marker_ttl < config.post_ttl);
        assert!(config.view_marker_ttl < config.post_ttl);
        assert!(config.comment_marker_ttl < config.post_ttl);
    }
}
