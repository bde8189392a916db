use std::sync::Arc;

use apalis::prelude::Error as ApalisError;

use crate::application::{heating::HeatingController, router::EventRouter};

/// Shared context for the per-kind event workers.
#[derive(Clone)]
pub struct EventJobContext {
    pub router: Arc<EventRouter>,
}

#[derive(Clone)]
pub struct HeatingJobContext {
    pub heating: Arc<HeatingController>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convert any error into an [`ApalisError::Failed`].
pub fn job_failed<E>(err: E) -> ApalisError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}
