use std::sync::Arc;

use tether_core::EventHandler;

use crate::bus::EventBus;

/// Scoped bus registration for correlation waiters.
///
/// The bus provides no automatic cleanup, so the waiter owns its
/// registration's entire lifetime: dropping the guard deregisters on every
/// terminal path, including cancellation of the waiting future.
pub(crate) struct Registration<'a, E> {
    bus: &'a EventBus<E>,
    handler: Arc<dyn EventHandler<E>>,
}

impl<'a, E> Registration<'a, E> {
    pub(crate) fn subscribe(bus: &'a EventBus<E>, handler: Arc<dyn EventHandler<E>>) -> Self {
        bus.subscribe(Arc::clone(&handler));
        Self { bus, handler }
    }
}

impl<E> Drop for Registration<'_, E> {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.handler);
    }
}
