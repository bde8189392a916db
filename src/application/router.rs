//! Dispatch of bus events to their writers.

use std::sync::Arc;

use thiserror::Error;

use crate::application::applier::{ApplyError, ApplyOutcome, EventApplier};
use crate::application::fanout::{FanoutError, FanoutWriter};
use crate::domain::events::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Publish event written into this many feeds.
    FannedOut(usize),
    Committed,
    Duplicate,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Fanout(#[from] FanoutError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

#[derive(Clone)]
pub struct EventRouter {
    fanout: Arc<FanoutWriter>,
    applier: Arc<EventApplier>,
}

impl EventRouter {
    pub fn new(fanout: Arc<FanoutWriter>, applier: Arc<EventApplier>) -> Self {
        Self { fanout, applier }
    }

    pub async fn dispatch(&self, event: &Event) -> Result<DispatchOutcome, DispatchError> {
        let applied = match event {
            Event::Publish(publish) => {
                let written = self.fanout.publish(publish).await?;
                return Ok(DispatchOutcome::FannedOut(written));
            }
            Event::Like(like) => self.applier.apply_like(like).await?,
            Event::View(view) => self.applier.apply_view(view).await?,
            Event::Comment(comment) => self.applier.apply_comment(comment).await?,
        };

        Ok(match applied {
            ApplyOutcome::Committed => DispatchOutcome::Committed,
            ApplyOutcome::Duplicate => DispatchOutcome::Duplicate,
        })
    }
}
