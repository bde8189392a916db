//! Wiring of the cache stores and the services built on them.

use std::sync::Arc;

use crate::application::{
    announce::Announcer,
    applier::EventApplier,
    fanout::FanoutWriter,
    feed::FeedService,
    heating::{HeatingConfig, HeatingController, HeatingPipeline},
    repos::CanonicalStore,
    router::EventRouter,
};
use crate::cache::{
    CacheBackend, CacheConfig, CanonicalLoader, FeedIndexStore, IdempotencyGuard, PostCacheStore,
    RetryPolicy,
};

/// Every service shares one backend and one canonical store.
#[derive(Clone)]
pub struct Engine {
    pub posts: PostCacheStore,
    pub feeds: FeedIndexStore,
    pub router: Arc<EventRouter>,
    pub heating: Arc<HeatingController>,
    pub feed: Arc<FeedService>,
}

impl Engine {
    pub fn assemble(
        backend: Arc<dyn CacheBackend>,
        canonical: Arc<dyn CanonicalStore>,
        announcer: Option<Arc<dyn Announcer>>,
        cache: CacheConfig,
        heating: HeatingConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&cache);
        let loader = CanonicalLoader::new(canonical, cache.recent_comments);
        let feeds = FeedIndexStore::new(backend.clone(), cache.feed_size, retry);
        let posts = PostCacheStore::new(backend.clone(), loader, cache);

        let applier = Arc::new(EventApplier::new(
            backend.clone(),
            posts.clone(),
            IdempotencyGuard::new(backend),
        ));
        let fanout = Arc::new(FanoutWriter::new(feeds.clone()));
        let router = Arc::new(EventRouter::new(fanout, applier));

        let pipeline = Arc::new(HeatingPipeline::new(posts.clone(), announcer, heating));
        let heating = Arc::new(HeatingController::new(pipeline));
        let feed = Arc::new(FeedService::new(
            feeds.clone(),
            posts.clone(),
            heating.clone(),
        ));

        Self {
            posts,
            feeds,
            router,
            heating,
            feed,
        }
    }
}
