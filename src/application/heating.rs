//! Batch cache heating.
//!
//! Pages through canonical posts published inside a trailing window,
//! assembles their cache records with one aggregation query per kind and
//! batch, writes each batch with a single pipeline and optionally announces
//! every cached post for downstream fan-out.
//!
//! At most one run is active at a time. A run has no interrupt point: once
//! accepted it continues until the canonical store reports no further pages.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::application::announce::Announcer;
use crate::application::repos::RepoError;
use crate::cache::PostCacheStore;
use crate::domain::entities::{PostCacheRecord, PostReadiness, PostRecord};

const METRIC_HEATING_POSTS: &str = "feedline_heating_posts_total";
const METRIC_HEATING_FAILURES: &str = "feedline_heating_failure_total";
const METRIC_HEATING_REJECTED: &str = "feedline_heating_rejected_total";
const METRIC_HEATING_RUN_MS: &str = "feedline_heating_run_ms";

const DEFAULT_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_BATCH_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeatingConfig {
    /// How far back from "now" published posts are heated.
    pub window: Duration,
    pub batch_size: u32,
    /// Announce each cached post once its batch is written.
    pub announce: bool,
}

impl Default for HeatingConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            batch_size: DEFAULT_BATCH_SIZE,
            announce: true,
        }
    }
}

impl From<&crate::config::HeatingSettings> for HeatingConfig {
    fn from(settings: &crate::config::HeatingSettings) -> Self {
        Self {
            window: settings.window,
            batch_size: settings.batch_size.get(),
            announce: settings.announce,
        }
    }
}

#[derive(Debug, Error)]
pub enum HeatingError {
    #[error("failed to read canonical page {page}: {source}")]
    Canonical {
        page: u32,
        #[source]
        source: RepoError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeatingReport {
    pub run_id: Uuid,
    pub pages: u32,
    pub posts_cached: usize,
    pub posts_announced: usize,
    /// Posts skipped because their batch or announcement failed.
    pub failures: usize,
    pub elapsed: Duration,
}

impl HeatingReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            pages: 0,
            posts_cached: 0,
            posts_announced: 0,
            failures: 0,
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Clone)]
pub struct HeatingPipeline {
    posts: PostCacheStore,
    announcer: Option<Arc<dyn Announcer>>,
    config: HeatingConfig,
}

impl HeatingPipeline {
    pub fn new(
        posts: PostCacheStore,
        announcer: Option<Arc<dyn Announcer>>,
        config: HeatingConfig,
    ) -> Self {
        Self {
            posts,
            announcer,
            config,
        }
    }

    /// Heats the trailing window ending now.
    pub async fn run(&self, run_id: Uuid) -> Result<HeatingReport, HeatingError> {
        let to = OffsetDateTime::now_utc();
        let from = to - self.config.window;
        self.run_range(run_id, from, to).await
    }

    /// Heats posts published in `[from, to]`.
    #[instrument(skip(self), fields(batch_size = self.config.batch_size))]
    pub async fn run_range(
        &self,
        run_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<HeatingReport, HeatingError> {
        let started = Instant::now();
        let store = self.posts.loader().store();
        let mut report = HeatingReport::new(run_id);
        let mut page = 0;

        loop {
            let batch = store
                .fetch_posts_in_range(from, to, page, self.config.batch_size)
                .await
                .map_err(|source| HeatingError::Canonical { page, source })?;
            report.pages += 1;

            if !batch.items.is_empty() {
                self.heat_batch(&batch.items, page, &mut report).await;
            }

            if !batch.has_next || batch.items.is_empty() {
                break;
            }
            page += 1;
        }

        report.elapsed = started.elapsed();
        histogram!(METRIC_HEATING_RUN_MS).record(report.elapsed.as_secs_f64() * 1000.0);
        info!(
            target = "application::heating",
            run_id = %report.run_id,
            pages = report.pages,
            posts_cached = report.posts_cached,
            posts_announced = report.posts_announced,
            failures = report.failures,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Cache heating finished"
        );
        Ok(report)
    }

    async fn heat_batch(
        &self,
        posts: &[PostRecord],
        page: u32,
        report: &mut HeatingReport,
    ) {
        let records = match self.posts.loader().assemble(posts).await {
            Ok(records) => records,
            Err(err) => {
                self.skip_batch(page, posts.len(), report, &err);
                return;
            }
        };

        if let Err(err) = self.posts.put_batch(&records).await {
            self.skip_batch(page, records.len(), report, &err);
            return;
        }
        report.posts_cached += records.len();
        counter!(METRIC_HEATING_POSTS).increment(records.len() as u64);

        if self.config.announce
            && let Some(announcer) = &self.announcer
        {
            // `assemble` keeps input order, so records pair with their posts.
            for (record, post) in records.iter().zip(posts) {
                match announcer.announce(&readiness(record, post)).await {
                    Ok(()) => report.posts_announced += 1,
                    Err(err) => {
                        report.failures += 1;
                        counter!(METRIC_HEATING_FAILURES).increment(1);
                        warn!(
                            target = "application::heating",
                            post_id = record.post_id,
                            error = %err,
                            "Skipping post whose readiness announcement failed"
                        );
                    }
                }
            }
        }
    }

    fn skip_batch(
        &self,
        page: u32,
        size: usize,
        report: &mut HeatingReport,
        err: &dyn std::error::Error,
    ) {
        report.failures += size;
        counter!(METRIC_HEATING_FAILURES).increment(size as u64);
        error!(
            target = "application::heating",
            page,
            size,
            error = %err,
            "Skipping heating batch"
        );
    }
}

fn readiness(record: &PostCacheRecord, post: &PostRecord) -> PostReadiness {
    PostReadiness {
        post_id: record.post_id,
        author_id: record.author_id,
        published_at: post.published_at,
        comment_author_ids: record
            .recent_comments
            .iter()
            .map(|comment| comment.author_id)
            .collect(),
        heated_at: OffsetDateTime::now_utc(),
    }
}

// ============================================================================
// Single-flight controller
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running { run_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Accepted { run_id: Uuid },
    /// Another run is active; nothing was queued.
    Rejected,
}

/// Owns the `idle | running` flag around a [`HeatingPipeline`].
#[derive(Clone)]
pub struct HeatingController {
    pipeline: Arc<HeatingPipeline>,
    state: Arc<watch::Sender<RunState>>,
}

/// Returns the controller to idle when a run ends, including by panic.
struct RunGuard {
    state: Arc<watch::Sender<RunState>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state.send_replace(RunState::Idle);
    }
}

impl HeatingController {
    pub fn new(pipeline: Arc<HeatingPipeline>) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            pipeline,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), RunState::Running { .. })
    }

    fn begin(&self) -> Option<(Uuid, RunGuard)> {
        let run_id = Uuid::new_v4();
        let accepted = self.state.send_if_modified(|state| match state {
            RunState::Idle => {
                *state = RunState::Running { run_id };
                true
            }
            RunState::Running { .. } => false,
        });

        if !accepted {
            counter!(METRIC_HEATING_REJECTED).increment(1);
            warn!(
                target = "application::heating",
                "Heating rejected: a run is already active"
            );
            return None;
        }
        let guard = RunGuard {
            state: Arc::clone(&self.state),
        };
        Some((run_id, guard))
    }

    /// Starts a background run unless one is active.
    pub fn trigger(&self) -> TriggerOutcome {
        let Some((run_id, guard)) = self.begin() else {
            return TriggerOutcome::Rejected;
        };

        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = pipeline.run(run_id).await {
                error!(
                    target = "application::heating",
                    run_id = %run_id,
                    error = %err,
                    "Cache heating aborted"
                );
            }
        });
        info!(
            target = "application::heating",
            run_id = %run_id,
            "Cache heating started"
        );
        TriggerOutcome::Accepted { run_id }
    }
}
