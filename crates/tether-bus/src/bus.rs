use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use tether_core::{Dispatch, DispatchError, DispatchFault, DispatchPolicy, EventHandler};

/// Ordered async publish/subscribe bus for one event type.
///
/// The handler list is copy-on-write: subscribe/unsubscribe swap in a new
/// list under a mutex and never mutate the snapshot a running publish is
/// iterating. A handler added mid-dispatch does not run that cycle; one
/// removed mid-dispatch still runs if already captured.
pub struct EventBus<E> {
    handlers: Mutex<Arc<Vec<Arc<dyn EventHandler<E>>>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Arc::new(Vec::new())),
        }
    }

    /// Append a handler. It runs after all currently subscribed handlers.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler<E>>) {
        let mut guard = self.handlers.lock();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(handler);
        *guard = Arc::new(next);
    }

    /// Remove a handler by identity (`Arc::ptr_eq`). Returns whether any
    /// registration was removed.
    pub fn unsubscribe(&self, handler: &Arc<dyn EventHandler<E>>) -> bool {
        let mut guard = self.handlers.lock();
        let before = guard.len();
        let next: Vec<_> = guard
            .iter()
            .filter(|h| !Arc::ptr_eq(h, handler))
            .cloned()
            .collect();
        if next.len() == before {
            return false;
        }
        *guard = Arc::new(next);
        true
    }

    pub fn unsubscribe_all(&self) {
        *self.handlers.lock() = Arc::new(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn EventHandler<E>>>> {
        Arc::clone(&self.handlers.lock())
    }
}

impl<E: Send + Sync> EventBus<E> {
    /// Dispatch an event to every handler captured at entry, strictly in
    /// subscription order, each fully awaited before the next starts.
    ///
    /// If the policy carries a budget, a single timer starts here; each
    /// handler races the remaining budget. A handler that outlives the
    /// budget is recorded as a non-fatal fault but is still awaited to real
    /// completion before the next handler runs, and the timer is not
    /// restarted for the rest of this dispatch.
    ///
    /// Concurrent publishes on the same bus are independent: each has its
    /// own snapshot, deadline, and fault accumulation.
    pub async fn publish(
        &self,
        event: &E,
        policy: &DispatchPolicy,
    ) -> Result<(), DispatchError> {
        let snapshot = self.snapshot();
        let dispatch = Dispatch::new();
        let deadline = policy.budget.map(|budget| Instant::now() + budget);
        let mut budget_spent = false;
        let mut thrown: Vec<DispatchFault> = Vec::new();

        for (index, handler) in snapshot.iter().enumerate() {
            if dispatch.is_handled() {
                break;
            }

            let outcome = match deadline.filter(|_| !budget_spent) {
                Some(deadline) => {
                    let mut fut = handler.handle(&dispatch, event);
                    match tokio::time::timeout_at(deadline, &mut fut).await {
                        Ok(result) => result,
                        Err(_) => {
                            budget_spent = true;
                            apply_fault(
                                DispatchFault::TimedOut {
                                    handler: index,
                                    budget: policy.budget.unwrap_or_default(),
                                },
                                policy,
                                &mut thrown,
                            );
                            // Await the real completion so the handler is
                            // never left running past the dispatch.
                            fut.await
                        }
                    }
                }
                None => handler.handle(&dispatch, event).await,
            };

            if let Err(error) = outcome {
                apply_fault(
                    DispatchFault::Faulted {
                        handler: index,
                        error,
                    },
                    policy,
                    &mut thrown,
                );
            }
        }

        if thrown.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::new(thrown))
        }
    }
}

fn apply_fault(
    fault: DispatchFault,
    policy: &DispatchPolicy,
    thrown: &mut Vec<DispatchFault>,
) {
    let handle = policy.should_handle(&fault);
    if handle {
        match &policy.on_fault {
            Some(hook) => hook(&fault),
            None => warn!(
                handler = fault.handler(),
                kind = fault.kind(),
                error = %fault,
                "dispatch fault handled"
            ),
        }
    }
    if policy.should_throw(&fault) {
        thrown.push(fault);
    } else if !handle {
        warn!(
            handler = fault.handler(),
            kind = fault.kind(),
            "dispatch fault dropped by policy"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tether_core::ErrorPolicy;

    struct Recorder {
        id: usize,
        order: Arc<Mutex<Vec<usize>>>,
        fail: bool,
        delay: Duration,
        mark_handled: bool,
    }

    impl Recorder {
        fn new(id: usize, order: Arc<Mutex<Vec<usize>>>) -> Arc<dyn EventHandler<u32>> {
            Arc::new(Self {
                id,
                order,
                fail: false,
                delay: Duration::ZERO,
                mark_handled: false,
            })
        }

        fn failing(id: usize, order: Arc<Mutex<Vec<usize>>>) -> Arc<dyn EventHandler<u32>> {
            Arc::new(Self {
                id,
                order,
                fail: true,
                delay: Duration::ZERO,
                mark_handled: false,
            })
        }

        fn slow(
            id: usize,
            order: Arc<Mutex<Vec<usize>>>,
            delay: Duration,
        ) -> Arc<dyn EventHandler<u32>> {
            Arc::new(Self {
                id,
                order,
                fail: false,
                delay,
                mark_handled: false,
            })
        }

        fn marking(id: usize, order: Arc<Mutex<Vec<usize>>>) -> Arc<dyn EventHandler<u32>> {
            Arc::new(Self {
                id,
                order,
                fail: false,
                delay: Duration::ZERO,
                mark_handled: true,
            })
        }
    }

    #[async_trait]
    impl EventHandler<u32> for Recorder {
        async fn handle(&self, dispatch: &Dispatch, _event: &u32) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.order.lock().push(self.id);
            if self.mark_handled {
                dispatch.mark_handled();
            }
            if self.fail {
                anyhow::bail!("handler {} failed", self.id);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in 0..4 {
            bus.subscribe(Recorder::new(id, Arc::clone(&order)));
        }

        bus.publish(&7, &DispatchPolicy::default()).await.unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_later_handlers() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Recorder::new(0, Arc::clone(&order)));
        bus.subscribe(Recorder::failing(1, Arc::clone(&order)));
        bus.subscribe(Recorder::new(2, Arc::clone(&order)));

        bus.publish(&7, &DispatchPolicy::default()).await.unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn throw_policy_aggregates_after_all_handlers_ran() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Recorder::failing(0, Arc::clone(&order)));
        bus.subscribe(Recorder::new(1, Arc::clone(&order)));
        bus.subscribe(Recorder::failing(2, Arc::clone(&order)));

        let err = bus
            .publish(&7, &DispatchPolicy::throw_all())
            .await
            .unwrap_err();
        // Both handlers ran despite the first failure.
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(err.faults.len(), 2);
        assert_eq!(err.faults[0].handler(), 0);
        assert_eq!(err.faults[1].handler(), 2);
    }

    #[tokio::test]
    async fn fault_hook_receives_handled_faults() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Recorder::failing(0, Arc::clone(&order)));

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let policy = DispatchPolicy::default()
            .with_fault_hook(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        bus.publish(&7, &policy).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_handler_times_out_but_is_awaited_to_completion() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Recorder::slow(
            0,
            Arc::clone(&order),
            Duration::from_millis(80),
        ));
        bus.subscribe(Recorder::new(1, Arc::clone(&order)));

        let policy = DispatchPolicy::throw_all().with_budget(Duration::from_millis(20));
        let started = std::time::Instant::now();
        let err = bus.publish(&7, &policy).await.unwrap_err();

        // The slow handler finished for real before the dispatch returned.
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(*order.lock(), vec![0, 1]);
        assert_eq!(err.faults.len(), 1);
        assert!(!err.faults[0].is_fatal());
        assert_eq!(err.faults[0].handler(), 0);
    }

    #[tokio::test]
    async fn budget_is_not_restarted_for_later_handlers() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Recorder::slow(
            0,
            Arc::clone(&order),
            Duration::from_millis(40),
        ));
        bus.subscribe(Recorder::slow(
            1,
            Arc::clone(&order),
            Duration::from_millis(40),
        ));

        let policy = DispatchPolicy::throw_all().with_budget(Duration::from_millis(15));
        let err = bus.publish(&7, &policy).await.unwrap_err();

        // Only the first handler races the timer; the second runs untimed.
        assert_eq!(*order.lock(), vec![0, 1]);
        assert_eq!(err.faults.len(), 1);
        assert_eq!(err.faults[0].handler(), 0);
    }

    #[tokio::test]
    async fn handled_flag_short_circuits_remaining_handlers() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Recorder::failing(0, Arc::clone(&order)));
        bus.subscribe(Recorder::marking(1, Arc::clone(&order)));
        bus.subscribe(Recorder::new(2, Arc::clone(&order)));

        let err = bus
            .publish(&7, &DispatchPolicy::throw_all())
            .await
            .unwrap_err();
        // Handler 2 never ran, but the fault collected before the mark is
        // still raised.
        assert_eq!(*order.lock(), vec![0, 1]);
        assert_eq!(err.faults.len(), 1);
    }

    struct MidDispatchSubscriber {
        bus: Arc<EventBus<u32>>,
        extra: Arc<dyn EventHandler<u32>>,
    }

    #[async_trait]
    impl EventHandler<u32> for MidDispatchSubscriber {
        async fn handle(&self, _dispatch: &Dispatch, _event: &u32) -> anyhow::Result<()> {
            self.bus.subscribe(Arc::clone(&self.extra));
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_added_mid_dispatch_runs_next_cycle_only() {
        let bus = Arc::new(EventBus::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Arc::new(MidDispatchSubscriber {
            bus: Arc::clone(&bus),
            extra: Recorder::new(9, Arc::clone(&order)),
        }));

        bus.publish(&7, &DispatchPolicy::default()).await.unwrap();
        assert!(order.lock().is_empty());

        bus.publish(&7, &DispatchPolicy::default()).await.unwrap();
        assert_eq!(*order.lock(), vec![9]);
    }

    #[tokio::test]
    async fn unsubscribe_by_identity() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let keep = Recorder::new(0, Arc::clone(&order));
        let drop_me = Recorder::new(1, Arc::clone(&order));
        bus.subscribe(Arc::clone(&keep));
        bus.subscribe(Arc::clone(&drop_me));

        assert!(bus.unsubscribe(&drop_me));
        assert!(!bus.unsubscribe(&drop_me));
        assert_eq!(bus.len(), 1);

        bus.publish(&7, &DispatchPolicy::default()).await.unwrap();
        assert_eq!(*order.lock(), vec![0]);
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_the_bus() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Recorder::new(0, Arc::clone(&order)));
        bus.subscribe(Recorder::new(1, Arc::clone(&order)));
        bus.unsubscribe_all();
        assert!(bus.is_empty());

        bus.publish(&7, &DispatchPolicy::default()).await.unwrap();
        assert!(order.lock().is_empty());
    }

    #[tokio::test]
    async fn concurrent_publishes_are_independent() {
        let bus = Arc::new(EventBus::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Recorder::slow(
            0,
            Arc::clone(&order),
            Duration::from_millis(20),
        ));

        let a = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.publish(&1, &DispatchPolicy::default()).await })
        };
        let b = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.publish(&2, &DispatchPolicy::default()).await })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(order.lock().len(), 2);
    }

    #[tokio::test]
    async fn neither_handle_nor_throw_still_runs_everything() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Recorder::failing(0, Arc::clone(&order)));
        bus.subscribe(Recorder::new(1, Arc::clone(&order)));

        let policy = DispatchPolicy::new(ErrorPolicy::empty());
        bus.publish(&7, &policy).await.unwrap();
        assert_eq!(*order.lock(), vec![0, 1]);
    }
}
