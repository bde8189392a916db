//! Bus handlers, one per event kind.
//!
//! A handler returns `Ok` only after the event's writes are committed (or the
//! delivery was recognised as a duplicate). Any error fails the job so the
//! bus redelivers it.

use apalis::prelude::{Data, Error as ApalisError};
use tracing::{debug, error};

use crate::{
    application::{error::ErrorReport, router::DispatchOutcome},
    domain::events::{CommentEvent, Event, LikeEvent, PublishEvent, ViewEvent},
};

use super::context::{EventJobContext, job_failed};

const SOURCE: &str = "application::jobs::events";

pub async fn process_publish_event_job(
    event: PublishEvent,
    context: Data<EventJobContext>,
) -> Result<(), ApalisError> {
    dispatch(&context, Event::Publish(event)).await
}

pub async fn process_like_event_job(
    event: LikeEvent,
    context: Data<EventJobContext>,
) -> Result<(), ApalisError> {
    dispatch(&context, Event::Like(event)).await
}

pub async fn process_view_event_job(
    event: ViewEvent,
    context: Data<EventJobContext>,
) -> Result<(), ApalisError> {
    dispatch(&context, Event::View(event)).await
}

pub async fn process_comment_event_job(
    event: CommentEvent,
    context: Data<EventJobContext>,
) -> Result<(), ApalisError> {
    dispatch(&context, Event::Comment(event)).await
}

async fn dispatch(context: &EventJobContext, event: Event) -> Result<(), ApalisError> {
    let kind = event.kind().as_str();
    let post_id = event.post_id();

    match context.router.dispatch(&event).await {
        Ok(DispatchOutcome::FannedOut(entries)) => {
            debug!(target = SOURCE, kind, post_id, entries, "publish event fanned out");
            Ok(())
        }
        Ok(DispatchOutcome::Committed) => {
            debug!(target = SOURCE, kind, post_id, "event applied");
            Ok(())
        }
        Ok(DispatchOutcome::Duplicate) => {
            debug!(target = SOURCE, kind, post_id, "duplicate delivery acknowledged");
            Ok(())
        }
        Err(err) => {
            let report = ErrorReport::from_error(SOURCE, &err);
            error!(
                target = SOURCE,
                kind,
                post_id,
                error = %report.chain(),
                "event processing failed; leaving it for redelivery"
            );
            Err(job_failed(err))
        }
    }
}
