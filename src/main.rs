use std::{process, sync::Arc};

use apalis::{
    layers::WorkerBuilderExt,
    prelude::{Monitor, WorkerBuilder, WorkerFactoryFn},
};
use apalis_cron::CronStream;
use apalis_sql::{Config as ApalisSqlConfig, postgres::PostgresStorage};
use feedline::{
    application::{
        announce::Announcer,
        engine::Engine,
        error::AppError,
        heating::{HeatingConfig, TriggerOutcome},
        jobs::{
            EventJobContext, HeatingJobContext, QueueAnnouncer, heating_schedule,
            process_comment_event_job, process_heat_cache_job, process_heat_request_job,
            process_like_event_job, process_publish_event_job, process_view_event_job,
            request_heating,
        },
        repos::{CanonicalStore, JobsRepo},
    },
    cache::{CacheBackend, CacheConfig, MemoryBackend},
    config,
    domain::types::JobType,
    infra::{db::PostgresRepositories, error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Heat(_) => run_heat(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let backend = Arc::new(MemoryBackend::new());
    let engine = build_engine(backend.clone(), repositories.clone(), &settings);

    if settings.heating.on_startup {
        match engine.heating.trigger() {
            TriggerOutcome::Accepted { run_id } => info!(
                target = "feedline::serve",
                run_id = %run_id,
                "Startup cache heating started"
            ),
            TriggerOutcome::Rejected => warn!(
                target = "feedline::serve",
                "Startup cache heating rejected"
            ),
        }
    }

    let sweep_interval = settings.cache.sweep_interval;
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            backend.purge_expired();
        }
    });

    let result = run_job_monitor(&repositories, &engine, &settings).await;

    sweeper.abort();
    let _ = sweeper.await;

    result
}

/// Queues a heating request for the running `serve` process. The cache is
/// process-local, so heating here would warm nothing that serves reads.
async fn run_heat(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let job_id = request_heating(&*repositories, announce_max_attempts(&settings)).await?;
    info!(
        target = "feedline::heat",
        job_id = %job_id,
        "Cache heating requested"
    );
    Ok(())
}

async fn init_repositories(
    settings: &config::Settings,
) -> Result<Arc<PostgresRepositories>, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(Arc::new(PostgresRepositories::new(pool)))
}

fn build_engine(
    backend: Arc<MemoryBackend>,
    repositories: Arc<PostgresRepositories>,
    settings: &config::Settings,
) -> Engine {
    let backend: Arc<dyn CacheBackend> = backend;
    let canonical: Arc<dyn CanonicalStore> = repositories.clone();
    let jobs_repo: Arc<dyn JobsRepo> = repositories;

    let announcer: Arc<dyn Announcer> = Arc::new(QueueAnnouncer::new(
        jobs_repo,
        announce_max_attempts(settings),
    ));

    Engine::assemble(
        backend,
        canonical,
        Some(announcer),
        CacheConfig::from(&settings.cache),
        HeatingConfig::from(&settings.heating),
    )
}

fn announce_max_attempts(settings: &config::Settings) -> i32 {
    // Bounded by config validation.
    i32::try_from(settings.jobs.announce_max_attempts.get()).unwrap_or(i32::MAX)
}

async fn run_job_monitor(
    repositories: &PostgresRepositories,
    engine: &Engine,
    settings: &config::Settings,
) -> Result<(), AppError> {
    let jobs = &settings.jobs;
    let context = EventJobContext {
        router: engine.router.clone(),
    };

    let publish_storage = PostgresStorage::new_with_config(
        repositories.pool().clone(),
        ApalisSqlConfig::new(JobType::PublishEvent.as_str()),
    );
    let like_storage = PostgresStorage::new_with_config(
        repositories.pool().clone(),
        ApalisSqlConfig::new(JobType::LikeEvent.as_str()),
    );
    let view_storage = PostgresStorage::new_with_config(
        repositories.pool().clone(),
        ApalisSqlConfig::new(JobType::ViewEvent.as_str()),
    );
    let comment_storage = PostgresStorage::new_with_config(
        repositories.pool().clone(),
        ApalisSqlConfig::new(JobType::CommentEvent.as_str()),
    );
    let heat_request_storage = PostgresStorage::new_with_config(
        repositories.pool().clone(),
        ApalisSqlConfig::new(JobType::HeatRequest.as_str()),
    );
    let heating_context = HeatingJobContext {
        heating: engine.heating.clone(),
    };

    let publish_worker = WorkerBuilder::new("publish-event-worker")
        .concurrency(jobs.publish_concurrency.get() as usize)
        .data(context.clone())
        .backend(publish_storage)
        .build_fn(process_publish_event_job);
    let like_worker = WorkerBuilder::new("like-event-worker")
        .concurrency(jobs.like_concurrency.get() as usize)
        .data(context.clone())
        .backend(like_storage)
        .build_fn(process_like_event_job);
    let view_worker = WorkerBuilder::new("view-event-worker")
        .concurrency(jobs.view_concurrency.get() as usize)
        .data(context.clone())
        .backend(view_storage)
        .build_fn(process_view_event_job);
    let comment_worker = WorkerBuilder::new("comment-event-worker")
        .concurrency(jobs.comment_concurrency.get() as usize)
        .data(context)
        .backend(comment_storage)
        .build_fn(process_comment_event_job);
    let heat_request_worker = WorkerBuilder::new("heat-request-worker")
        .concurrency(1)
        .data(heating_context.clone())
        .backend(heat_request_storage)
        .build_fn(process_heat_request_job);

    let mut monitor = Monitor::new()
        .register(publish_worker)
        .register(like_worker)
        .register(view_worker)
        .register(comment_worker)
        .register(heat_request_worker);

    if let Some(expression) = settings.heating.schedule.as_deref() {
        let schedule = heating_schedule(expression)?;
        let heating_worker = WorkerBuilder::new("heat-cache-worker")
            .data(heating_context)
            .backend(CronStream::new(schedule))
            .build_fn(process_heat_cache_job);
        monitor = monitor.register(heating_worker);
        info!(
            target = "feedline::serve",
            schedule = expression,
            "Scheduled cache heating enabled"
        );
    }

    info!(target = "feedline::serve", "Event workers started");
    monitor
        .run_with_signal(tokio::signal::ctrl_c())
        .await
        .map_err(|err| AppError::from(InfraError::bus(format!("job monitor stopped: {err}"))))
}
