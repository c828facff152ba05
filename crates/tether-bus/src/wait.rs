use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use tether_core::{Dispatch, EventHandler};

use crate::bus::EventBus;
use crate::registration::Registration;

/// One-shot correlation waiter backing [`wait_for`].
struct WaitHandler<E, P> {
    predicate: P,
    slot: Mutex<Option<oneshot::Sender<E>>>,
}

#[async_trait]
impl<E, P> EventHandler<E> for WaitHandler<E, P>
where
    E: Clone + Send + Sync,
    P: Fn(&E) -> bool + Send + Sync,
{
    async fn handle(&self, _dispatch: &Dispatch, event: &E) -> anyhow::Result<()> {
        if self.slot.lock().is_none() {
            return Ok(());
        }
        match catch_unwind(AssertUnwindSafe(|| (self.predicate)(event))) {
            Ok(true) => {
                if let Some(tx) = self.slot.lock().take() {
                    let _ = tx.send(event.clone());
                }
            }
            Ok(false) => {}
            Err(_) => {
                // A faulting predicate abandons this waiter only; dispatch
                // to other subscribers continues untouched.
                warn!("correlation predicate panicked; abandoning waiter");
                drop(self.slot.lock().take());
            }
        }
        Ok(())
    }
}

/// Wait for the first event on `bus` matching `predicate`, in the bus's own
/// delivery order. Resolves `None` on timeout or if the predicate faults.
///
/// The registration is removed on every terminal path (match, timeout, or
/// cancellation of the returned future), so no pending waiter outlives its
/// deadline. The predicate must not publish to the same bus synchronously;
/// reentrancy is undefined.
pub async fn wait_for<E, P>(bus: &EventBus<E>, predicate: P, timeout: Duration) -> Option<E>
where
    E: Clone + Send + Sync + 'static,
    P: Fn(&E) -> bool + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let handler: Arc<dyn EventHandler<E>> = Arc::new(WaitHandler {
        predicate,
        slot: Mutex::new(Some(tx)),
    });
    let _registration = Registration::subscribe(bus, handler);

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(event)) => Some(event),
        // Sender dropped: the predicate faulted and the waiter was abandoned.
        Ok(Err(_)) => None,
        Err(_) => None,
    }
}
