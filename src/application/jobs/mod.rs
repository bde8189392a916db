mod context;
mod events;
mod heating;
mod readiness;

pub use context::{EventJobContext, HeatingJobContext, job_failed};
pub use events::{
    process_comment_event_job, process_like_event_job, process_publish_event_job,
    process_view_event_job,
};
pub use heating::{
    HeatCacheTick, HeatRequest, heating_schedule, process_heat_cache_job,
    process_heat_request_job, request_heating,
};
pub use readiness::QueueAnnouncer;
