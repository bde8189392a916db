//! Cache heating triggers: the cron tick and on-demand requests queued on
//! `heat_request`. Both start a run through the serving process's
//! controller, so the heated records land in the cache that serves reads.

use std::str::FromStr;

use apalis::prelude::{Data, Error as ApalisError};
use apalis_cron::Schedule;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::application::heating::TriggerOutcome;
use crate::application::repos::{JobsRepo, NewJobRecord, RepoError};
use crate::domain::error::DomainError;
use crate::domain::types::JobType;

use super::context::HeatingJobContext;

const HEAT_REQUEST_PRIORITY: i32 = 0;

/// Tick emitted by the heating schedule.
/// Must implement `From<chrono::DateTime<chrono::Utc>>` for apalis-cron compatibility.
#[derive(Default, Debug, Clone)]
pub struct HeatCacheTick;

impl From<chrono::DateTime<chrono::Utc>> for HeatCacheTick {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

/// Starts a heating run unless one is already active. A rejected tick is
/// not an error; the next tick tries again.
pub async fn process_heat_cache_job(
    _tick: HeatCacheTick,
    ctx: Data<HeatingJobContext>,
) -> Result<(), ApalisError> {
    match ctx.heating.trigger() {
        TriggerOutcome::Accepted { run_id } => {
            info!(
                target = "application::jobs::heating",
                run_id = %run_id,
                "scheduled cache heating started"
            );
        }
        TriggerOutcome::Rejected => {
            warn!(
                target = "application::jobs::heating",
                "scheduled cache heating skipped: previous run still active"
            );
        }
    }
    Ok(())
}

/// On-demand heating request, queued by `feedline heat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeatRequest {
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
}

/// Queues a heating request and returns its job id.
pub async fn request_heating(jobs: &dyn JobsRepo, max_attempts: i32) -> Result<String, RepoError> {
    let request = HeatRequest {
        requested_at: OffsetDateTime::now_utc(),
    };
    let payload = serde_json::to_value(&request).map_err(|err| RepoError::InvalidInput {
        message: err.to_string(),
    })?;

    jobs.enqueue_job(NewJobRecord {
        job_type: JobType::HeatRequest,
        payload,
        run_at: request.requested_at,
        max_attempts,
        priority: HEAT_REQUEST_PRIORITY,
    })
    .await
}

/// Starts a heating run for a queued request. A request that arrives while
/// a run is active is satisfied by that run and completes without error.
pub async fn process_heat_request_job(
    request: HeatRequest,
    ctx: Data<HeatingJobContext>,
) -> Result<(), ApalisError> {
    match ctx.heating.trigger() {
        TriggerOutcome::Accepted { run_id } => {
            info!(
                target = "application::jobs::heating",
                run_id = %run_id,
                requested_at = %request.requested_at,
                "requested cache heating started"
            );
        }
        TriggerOutcome::Rejected => {
            info!(
                target = "application::jobs::heating",
                requested_at = %request.requested_at,
                "requested cache heating joined the active run"
            );
        }
    }
    Ok(())
}

/// Parses a six-field cron expression (seconds first).
pub fn heating_schedule(expression: &str) -> Result<Schedule, DomainError> {
    Schedule::from_str(expression)
        .map_err(|err| DomainError::invalid_schedule(expression, err.to_string()))
}
