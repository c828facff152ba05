use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

/// Shared state for one in-flight publish, visible to every handler it runs.
///
/// A handler that calls [`Dispatch::mark_handled`] stops the bus from
/// invoking the remaining handlers in the same dispatch. Faults already
/// collected under a throw policy are still raised at the end.
#[derive(Debug, Default)]
pub struct Dispatch {
    handled: AtomicBool,
}

impl Dispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop invoking further handlers in this dispatch.
    pub fn mark_handled(&self) {
        self.handled.store(true, Ordering::Release);
    }

    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Acquire)
    }
}

/// A subscriber on an event bus.
///
/// Handlers run strictly sequentially in subscription order; each is fully
/// awaited before the next starts. A returned error is a fatal fault for
/// this handler only and never stops the remaining handlers.
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    async fn handle(&self, dispatch: &Dispatch, event: &E) -> anyhow::Result<()>;
}
