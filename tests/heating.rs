mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use feedline::application::heating::{
    HeatingConfig, HeatingError, HeatingPipeline, RunState, TriggerOutcome,
};
use apalis::prelude::Data;
use feedline::application::jobs::{HeatRequest, HeatingJobContext, process_heat_request_job};
use feedline::cache::MemoryBackend;
use time::OffsetDateTime;
use uuid::Uuid;

use support::{InMemoryCanonical, RecordingAnnouncer, at_millis, engine, post, wait_until_idle};

fn pipeline(
    canonical: Arc<InMemoryCanonical>,
    announcer: Option<Arc<RecordingAnnouncer>>,
    batch_size: u32,
) -> (HeatingPipeline, feedline::application::engine::Engine) {
    let engine = engine(Arc::new(MemoryBackend::new()), canonical);
    let config = HeatingConfig {
        batch_size,
        ..Default::default()
    };
    let announcer = announcer.map(|a| a as Arc<dyn feedline::application::announce::Announcer>);
    let pipeline = HeatingPipeline::new(engine.posts.clone(), announcer, config);
    (pipeline, engine)
}

fn seed_posts(canonical: &InMemoryCanonical, ids: impl IntoIterator<Item = i64>) {
    for id in ids {
        canonical.insert_post(post(id, id * 10, &format!("post {id}"), id * 1_000));
    }
}

#[tokio::test]
async fn heats_every_post_in_range_across_pages() {
    let canonical = InMemoryCanonical::new();
    seed_posts(&canonical, 1..=5);
    // Outside the range.
    canonical.insert_post(post(99, 1, "ancient", 10));
    canonical.set_likes(2, 3);
    canonical.insert_comment(1, 4, 40, "nice", 4_500);
    let announcer = RecordingAnnouncer::new();
    let (pipeline, engine) = pipeline(canonical.clone(), Some(announcer.clone()), 2);

    let report = pipeline
        .run_range(Uuid::new_v4(), at_millis(1_000), at_millis(5_000))
        .await
        .unwrap();

    assert_eq!(report.posts_cached, 5);
    assert_eq!(report.posts_announced, 5);
    assert_eq!(report.failures, 0);
    assert_eq!(report.pages, 3);
    assert_eq!(canonical.range_calls.load(Ordering::SeqCst), 3);

    for id in 1..=5 {
        let record = engine.posts.cached(id).await.unwrap().expect("heated");
        assert_eq!(record.author_id, id * 10);
    }
    assert!(engine.posts.cached(99).await.unwrap().is_none());
    assert_eq!(engine.posts.cached(2).await.unwrap().unwrap().like_count, 3);
    let heated = engine.posts.cached(4).await.unwrap().unwrap();
    assert_eq!(heated.comment_count, 1);
    assert_eq!(heated.recent_comments[0].author_id, 40);

    let mut announced = announcer.announced_ids();
    announced.sort_unstable();
    assert_eq!(announced, vec![1, 2, 3, 4, 5]);
    let readiness = announcer
        .announced
        .lock()
        .unwrap()
        .iter()
        .find(|readiness| readiness.post_id == 4)
        .cloned()
        .unwrap();
    assert_eq!(readiness.author_id, 40);
    assert_eq!(readiness.comment_author_ids, vec![40]);
    assert_eq!(readiness.published_at, at_millis(4_000));
}

#[tokio::test]
async fn readiness_carries_publication_time_not_creation_time() {
    let canonical = InMemoryCanonical::new();
    canonical.insert_post(feedline::domain::entities::PostRecord {
        created_at: at_millis(500),
        ..post(6, 2, "drafted early", 3_000)
    });
    let announcer = RecordingAnnouncer::new();
    let (pipeline, engine) = pipeline(canonical, Some(announcer.clone()), 10);

    pipeline
        .run_range(Uuid::new_v4(), at_millis(0), at_millis(5_000))
        .await
        .unwrap();

    let announced = announcer.announced.lock().unwrap().clone();
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0].published_at, at_millis(3_000));
    let cached = engine.posts.cached(6).await.unwrap().unwrap();
    assert_eq!(cached.created_at, at_millis(500));
}

#[tokio::test]
async fn empty_range_completes_with_one_page() {
    let canonical = InMemoryCanonical::new();
    let (pipeline, _engine) = pipeline(canonical, None, 10);

    let report = pipeline
        .run_range(Uuid::new_v4(), at_millis(0), at_millis(1_000))
        .await
        .unwrap();

    assert_eq!(report.pages, 1);
    assert_eq!(report.posts_cached, 0);
}

#[tokio::test]
async fn rejected_announcements_are_counted_and_skipped() {
    let canonical = InMemoryCanonical::new();
    seed_posts(&canonical, 1..=3);
    let announcer = RecordingAnnouncer::new();
    announcer.reject.lock().unwrap().push(2);
    let (pipeline, engine) = pipeline(canonical, Some(announcer.clone()), 10);

    let report = pipeline
        .run_range(Uuid::new_v4(), at_millis(0), at_millis(10_000))
        .await
        .unwrap();

    assert_eq!(report.posts_cached, 3);
    assert_eq!(report.posts_announced, 2);
    assert_eq!(report.failures, 1);
    assert!(engine.posts.cached(2).await.unwrap().is_some());
    assert!(!announcer.announced_ids().contains(&2));
}

#[tokio::test]
async fn announcing_can_be_disabled() {
    let canonical = InMemoryCanonical::new();
    seed_posts(&canonical, 1..=2);
    let announcer = RecordingAnnouncer::new();
    let engine = engine(Arc::new(MemoryBackend::new()), canonical);
    let pipeline = HeatingPipeline::new(
        engine.posts.clone(),
        Some(announcer.clone()),
        HeatingConfig {
            announce: false,
            ..Default::default()
        },
    );

    let report = pipeline
        .run_range(Uuid::new_v4(), at_millis(0), at_millis(10_000))
        .await
        .unwrap();

    assert_eq!(report.posts_cached, 2);
    assert_eq!(report.posts_announced, 0);
    assert!(announcer.announced_ids().is_empty());
}

#[tokio::test]
async fn failed_aggregation_skips_only_that_batch() {
    let canonical = InMemoryCanonical::new();
    seed_posts(&canonical, 1..=4);
    canonical.fail_aggregations.store(1, Ordering::SeqCst);
    let (pipeline, engine) = pipeline(canonical, None, 2);

    let report = pipeline
        .run_range(Uuid::new_v4(), at_millis(0), at_millis(10_000))
        .await
        .unwrap();

    // Newest first: the first page holds posts 4 and 3.
    assert_eq!(report.failures, 2);
    assert_eq!(report.posts_cached, 2);
    assert!(engine.posts.cached(4).await.unwrap().is_none());
    assert!(engine.posts.cached(3).await.unwrap().is_none());
    assert!(engine.posts.cached(2).await.unwrap().is_some());
    assert!(engine.posts.cached(1).await.unwrap().is_some());
}

#[tokio::test]
async fn canonical_range_failure_aborts_the_run() {
    let canonical = InMemoryCanonical::new();
    seed_posts(&canonical, 1..=2);
    canonical.fail_range.store(true, Ordering::SeqCst);
    let (pipeline, _engine) = pipeline(canonical, None, 10);

    let err = pipeline
        .run_range(Uuid::new_v4(), at_millis(0), at_millis(10_000))
        .await
        .unwrap_err();

    assert!(matches!(err, HeatingError::Canonical { page: 0, .. }));
}

#[tokio::test]
async fn heating_does_not_touch_feeds() {
    let canonical = InMemoryCanonical::new();
    seed_posts(&canonical, 1..=2);
    let (pipeline, engine) = pipeline(canonical, None, 10);

    pipeline
        .run_range(Uuid::new_v4(), at_millis(0), at_millis(10_000))
        .await
        .unwrap();

    assert!(engine.feeds.read_page(10, 0, 10).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_trigger_is_rejected_while_running() {
    let canonical = InMemoryCanonical::new();
    let now = OffsetDateTime::now_utc();
    canonical.insert_post(feedline::domain::entities::PostRecord {
        published_at: now - Duration::from_secs(60),
        ..post(1, 2, "recent", 0)
    });
    *canonical.range_delay.lock().unwrap() = Some(Duration::from_secs(5));
    let engine = engine(Arc::new(MemoryBackend::new()), canonical);

    let first = engine.heating.trigger();
    assert!(matches!(first, TriggerOutcome::Accepted { .. }));
    assert!(engine.heating.is_running());
    assert_eq!(engine.feed.trigger_heating(), TriggerOutcome::Rejected);

    wait_until_idle(&engine).await;
    assert_eq!(engine.heating.state(), RunState::Idle);
    assert!(engine.posts.cached(1).await.unwrap().is_some());

    assert!(matches!(
        engine.heating.trigger(),
        TriggerOutcome::Accepted { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn queued_heat_request_warms_the_serving_cache() {
    let canonical = InMemoryCanonical::new();
    let now = OffsetDateTime::now_utc();
    canonical.insert_post(feedline::domain::entities::PostRecord {
        published_at: now - Duration::from_secs(60),
        ..post(1, 2, "recent", 0)
    });
    *canonical.range_delay.lock().unwrap() = Some(Duration::from_secs(1));
    let engine = engine(Arc::new(MemoryBackend::new()), canonical.clone());
    let context = HeatingJobContext {
        heating: engine.heating.clone(),
    };
    let request = HeatRequest { requested_at: now };

    process_heat_request_job(request.clone(), Data::new(context.clone()))
        .await
        .unwrap();
    assert!(engine.heating.is_running());
    // A request during the active run is absorbed by it.
    process_heat_request_job(request, Data::new(context))
        .await
        .unwrap();

    wait_until_idle(&engine).await;
    assert_eq!(canonical.range_calls.load(Ordering::SeqCst), 1);
    assert!(engine.posts.cached(1).await.unwrap().is_some());
}
