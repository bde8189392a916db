//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::apply_timeout_for;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "feedline";
const ENV_PREFIX: &str = "FEEDLINE";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_FEED_SIZE: u64 = 500;
const DEFAULT_RECENT_COMMENTS: u64 = 3;
const DEFAULT_POST_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_MARKER_TTL_SECS: u64 = 12 * 60 * 60;
const DEFAULT_RETRY_ATTEMPTS: u64 = 3;
const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_JOB_PUBLISH_CONCURRENCY: u32 = 4;
const DEFAULT_JOB_LIKE_CONCURRENCY: u32 = 4;
const DEFAULT_JOB_VIEW_CONCURRENCY: u32 = 4;
const DEFAULT_JOB_COMMENT_CONCURRENCY: u32 = 2;
const DEFAULT_ANNOUNCE_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_HEATING_WINDOW_DAYS: u64 = 7;
const DEFAULT_HEATING_BATCH_SIZE: u64 = 100;
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Command-line arguments for the feedline binary.
#[derive(Debug, Parser)]
#[command(name = "feedline", version, about = "Feed cache and fan-out engine")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FEEDLINE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the event workers and scheduled cache heating.
    Serve(Box<ServeArgs>),
    /// Ask the running `serve` process for one cache heating pass.
    Heat(HeatArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the per-user feed bound.
    #[arg(long = "cache-feed-size", value_name = "COUNT")]
    pub cache_feed_size: Option<u64>,

    /// Override the publish-event worker concurrency.
    #[arg(long = "jobs-publish-concurrency", value_name = "COUNT")]
    pub jobs_publish_concurrency: Option<u32>,

    /// Override the like-event worker concurrency.
    #[arg(long = "jobs-like-concurrency", value_name = "COUNT")]
    pub jobs_like_concurrency: Option<u32>,

    /// Override the view-event worker concurrency.
    #[arg(long = "jobs-view-concurrency", value_name = "COUNT")]
    pub jobs_view_concurrency: Option<u32>,

    /// Override the comment-event worker concurrency.
    #[arg(long = "jobs-comment-concurrency", value_name = "COUNT")]
    pub jobs_comment_concurrency: Option<u32>,

    /// Run cache heating once at startup.
    #[arg(
        long = "heating-on-startup",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub heating_on_startup: Option<bool>,

    /// Override the cron expression for scheduled heating.
    #[arg(long = "heating-schedule", value_name = "CRON")]
    pub heating_schedule: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct HeatArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub logging: LoggingOverrides,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub jobs: JobsSettings,
    pub heating: HeatingSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub feed_size: NonZeroU32,
    pub recent_comments: NonZeroU32,
    pub post_ttl: Duration,
    pub like_marker_ttl: Duration,
    pub view_marker_ttl: Duration,
    pub comment_marker_ttl: Duration,
    pub retry_attempts: NonZeroU32,
    pub retry_initial_backoff: Duration,
    pub apply_timeout: Duration,
    pub populate_missing_on_read: bool,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub publish_concurrency: NonZeroU32,
    pub like_concurrency: NonZeroU32,
    pub view_concurrency: NonZeroU32,
    pub comment_concurrency: NonZeroU32,
    pub announce_max_attempts: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct HeatingSettings {
    pub window: Duration,
    pub batch_size: NonZeroU32,
    pub announce: bool,
    pub on_startup: bool,
    /// Six-field cron expression; `None` disables scheduled heating.
    pub schedule: Option<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Heat(args)) => raw.apply_heat_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    jobs: RawJobsSettings,
    heating: RawHeatingSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_database_override(&overrides.database);
        self.apply_logging_overrides(&overrides.logging);
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(size) = overrides.cache_feed_size {
            self.cache.feed_size = Some(size);
        }
        if let Some(value) = overrides.jobs_publish_concurrency {
            self.jobs.publish_concurrency = Some(value);
        }
        if let Some(value) = overrides.jobs_like_concurrency {
            self.jobs.like_concurrency = Some(value);
        }
        if let Some(value) = overrides.jobs_view_concurrency {
            self.jobs.view_concurrency = Some(value);
        }
        if let Some(value) = overrides.jobs_comment_concurrency {
            self.jobs.comment_concurrency = Some(value);
        }
        if let Some(on_startup) = overrides.heating_on_startup {
            self.heating.on_startup = Some(on_startup);
        }
        if let Some(schedule) = overrides.heating_schedule.as_ref() {
            self.heating.schedule = Some(schedule.clone());
        }
    }

    fn apply_heat_overrides(&mut self, args: &HeatArgs) {
        self.apply_database_override(&args.database);
        self.apply_logging_overrides(&args.logging);
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            cache,
            jobs,
            heating,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            cache: build_cache_settings(cache)?,
            jobs: build_jobs_settings(jobs)?,
            heating: build_heating_settings(heating)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let feed_size = non_zero_u32(
        cache.feed_size.unwrap_or(DEFAULT_FEED_SIZE),
        "cache.feed_size",
    )?;
    let recent_comments = non_zero_u32(
        cache.recent_comments.unwrap_or(DEFAULT_RECENT_COMMENTS),
        "cache.recent_comments",
    )?;
    let retry_attempts = non_zero_u32(
        cache.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
        "cache.retry_attempts",
    )?;

    let post_ttl = positive_duration(
        cache.post_ttl_seconds.unwrap_or(DEFAULT_POST_TTL_SECS),
        Duration::from_secs,
        "cache.post_ttl_seconds",
    )?;
    let like_marker_ttl = marker_ttl(
        cache.like_marker_ttl_seconds,
        post_ttl,
        "cache.like_marker_ttl_seconds",
    )?;
    let view_marker_ttl = marker_ttl(
        cache.view_marker_ttl_seconds,
        post_ttl,
        "cache.view_marker_ttl_seconds",
    )?;
    let comment_marker_ttl = marker_ttl(
        cache.comment_marker_ttl_seconds,
        post_ttl,
        "cache.comment_marker_ttl_seconds",
    )?;

    let retry_initial_backoff = positive_duration(
        cache
            .retry_initial_backoff_ms
            .unwrap_or(DEFAULT_RETRY_INITIAL_BACKOFF_MS),
        Duration::from_millis,
        "cache.retry_initial_backoff_ms",
    )?;
    let apply_timeout = match cache.apply_timeout_ms {
        Some(millis) => positive_duration(millis, Duration::from_millis, "cache.apply_timeout_ms")?,
        None => apply_timeout_for(retry_attempts.get(), retry_initial_backoff),
    };
    let sweep_interval = positive_duration(
        cache
            .sweep_interval_seconds
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        Duration::from_secs,
        "cache.sweep_interval_seconds",
    )?;

    Ok(CacheSettings {
        feed_size,
        recent_comments,
        post_ttl,
        like_marker_ttl,
        view_marker_ttl,
        comment_marker_ttl,
        retry_attempts,
        retry_initial_backoff,
        apply_timeout,
        populate_missing_on_read: cache.populate_missing_on_read.unwrap_or(false),
        sweep_interval,
    })
}

fn build_jobs_settings(jobs: RawJobsSettings) -> Result<JobsSettings, LoadError> {
    let publish = jobs
        .publish_concurrency
        .unwrap_or(DEFAULT_JOB_PUBLISH_CONCURRENCY);
    let like = jobs
        .like_concurrency
        .unwrap_or(DEFAULT_JOB_LIKE_CONCURRENCY);
    let view = jobs
        .view_concurrency
        .unwrap_or(DEFAULT_JOB_VIEW_CONCURRENCY);
    let comment = jobs
        .comment_concurrency
        .unwrap_or(DEFAULT_JOB_COMMENT_CONCURRENCY);
    let announce = jobs
        .announce_max_attempts
        .unwrap_or(DEFAULT_ANNOUNCE_MAX_ATTEMPTS);

    let announce_max_attempts = non_zero_u32(announce.into(), "jobs.announce_max_attempts")?;
    if i32::try_from(announce_max_attempts.get()).is_err() {
        return Err(LoadError::invalid(
            "jobs.announce_max_attempts",
            "value exceeds supported range for i32",
        ));
    }

    Ok(JobsSettings {
        publish_concurrency: non_zero_u32(publish.into(), "jobs.publish_concurrency")?,
        like_concurrency: non_zero_u32(like.into(), "jobs.like_concurrency")?,
        view_concurrency: non_zero_u32(view.into(), "jobs.view_concurrency")?,
        comment_concurrency: non_zero_u32(comment.into(), "jobs.comment_concurrency")?,
        announce_max_attempts,
    })
}

fn build_heating_settings(heating: RawHeatingSettings) -> Result<HeatingSettings, LoadError> {
    let window_days = heating.window_days.unwrap_or(DEFAULT_HEATING_WINDOW_DAYS);
    if window_days == 0 {
        return Err(LoadError::invalid(
            "heating.window_days",
            "must be greater than zero",
        ));
    }
    let window_secs = window_days
        .checked_mul(SECONDS_PER_DAY)
        .ok_or_else(|| LoadError::invalid("heating.window_days", "window is too large"))?;

    let batch_size = non_zero_u32(
        heating.batch_size.unwrap_or(DEFAULT_HEATING_BATCH_SIZE),
        "heating.batch_size",
    )?;

    let schedule = match heating.schedule {
        Some(expression) if !expression.trim().is_empty() => {
            let expression = expression.trim().to_string();
            apalis_cron::Schedule::from_str(&expression).map_err(|err| {
                LoadError::invalid("heating.schedule", format!("invalid cron expression: {err}"))
            })?;
            Some(expression)
        }
        _ => None,
    };

    Ok(HeatingSettings {
        window: Duration::from_secs(window_secs),
        batch_size,
        announce: heating.announce.unwrap_or(true),
        on_startup: heating.on_startup.unwrap_or(false),
        schedule,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    feed_size: Option<u64>,
    recent_comments: Option<u64>,
    post_ttl_seconds: Option<u64>,
    like_marker_ttl_seconds: Option<u64>,
    view_marker_ttl_seconds: Option<u64>,
    comment_marker_ttl_seconds: Option<u64>,
    retry_attempts: Option<u64>,
    retry_initial_backoff_ms: Option<u64>,
    apply_timeout_ms: Option<u64>,
    populate_missing_on_read: Option<bool>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawJobsSettings {
    publish_concurrency: Option<u32>,
    like_concurrency: Option<u32>,
    view_concurrency: Option<u32>,
    comment_concurrency: Option<u32>,
    announce_max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHeatingSettings {
    window_days: Option<u64>,
    batch_size: Option<u64>,
    announce: Option<bool>,
    on_startup: Option<bool>,
    schedule: Option<String>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }

    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;

    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_duration(
    value: u64,
    unit: fn(u64) -> Duration,
    key: &'static str,
) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(unit(value))
}

/// Markers must lapse before the record they guard.
fn marker_ttl(
    value: Option<u64>,
    post_ttl: Duration,
    key: &'static str,
) -> Result<Duration, LoadError> {
    let ttl = positive_duration(
        value.unwrap_or(DEFAULT_MARKER_TTL_SECS),
        Duration::from_secs,
        key,
    )?;
    if ttl >= post_ttl {
        return Err(LoadError::invalid(
            key,
            format!(
                "must be shorter than cache.post_ttl_seconds ({}s)",
                post_ttl.as_secs()
            ),
        ));
    }
    Ok(ttl)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
