use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use tether_core::{Dispatch, EventHandler};

use crate::bus::EventBus;
use crate::registration::Registration;

/// Accumulating correlation handler backing [`collect_matches`].
struct CollectHandler<E, P> {
    predicate: P,
    matches: Mutex<Vec<E>>,
    abandoned: AtomicBool,
}

#[async_trait]
impl<E, P> EventHandler<E> for CollectHandler<E, P>
where
    E: Clone + PartialEq + Send + Sync,
    P: Fn(&E) -> bool + Send + Sync,
{
    async fn handle(&self, _dispatch: &Dispatch, event: &E) -> anyhow::Result<()> {
        if self.abandoned.load(Ordering::Acquire) {
            return Ok(());
        }
        match catch_unwind(AssertUnwindSafe(|| (self.predicate)(event))) {
            Ok(true) => {
                let mut matches = self.matches.lock();
                // Distinct by value equality: a re-delivered equal event is
                // not collected twice.
                if !matches.contains(event) {
                    matches.push(event.clone());
                }
            }
            Ok(false) => {}
            Err(_) => {
                warn!("correlation predicate panicked; keeping partial collection");
                self.abandoned.store(true, Ordering::Release);
            }
        }
        Ok(())
    }
}

/// Collect every distinct event matching `predicate` for the full `window`,
/// then resolve with the matches in the bus's delivery order.
///
/// If the predicate faults, collection stops but whatever was already
/// gathered is still returned. The registration is removed on every
/// terminal path, including cancellation.
pub async fn collect_matches<E, P>(bus: &EventBus<E>, predicate: P, window: Duration) -> Vec<E>
where
    E: Clone + PartialEq + Send + Sync + 'static,
    P: Fn(&E) -> bool + Send + Sync + 'static,
{
    let handler = Arc::new(CollectHandler {
        predicate,
        matches: Mutex::new(Vec::new()),
        abandoned: AtomicBool::new(false),
    });
    let registration: Arc<dyn EventHandler<E>> = handler.clone();
    let _registration = Registration::subscribe(bus, registration);

    tokio::time::sleep(window).await;
    // Bound to a local so the lock guard drops before `handler` does.
    let matches = std::mem::take(&mut *handler.matches.lock());
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    use tether_core::DispatchPolicy;

    #[tokio::test]
    async fn collects_all_matches_in_delivery_order() {
        let bus = Arc::new(EventBus::new());
        let collector = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                collect_matches(&bus, |e: &u32| *e % 2 == 0, Duration::from_millis(60)).await
            })
        };
        tokio::task::yield_now().await;

        for event in [1u32, 2, 4] {
            bus.publish(&event, &DispatchPolicy::default()).await.unwrap();
        }
        assert_eq!(collector.await.unwrap(), vec![2, 4]);
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn value_equal_redelivery_is_not_duplicated() {
        let bus = Arc::new(EventBus::new());
        let collector = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                collect_matches(&bus, |_: &u32| true, Duration::from_millis(60)).await
            })
        };
        tokio::task::yield_now().await;

        for event in [2u32, 2, 3, 2] {
            bus.publish(&event, &DispatchPolicy::default()).await.unwrap();
        }
        assert_eq!(collector.await.unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn runs_for_the_full_window() {
        let bus = Arc::new(EventBus::<u32>::new());
        let started = std::time::Instant::now();
        let matches = collect_matches(&bus, |_: &u32| true, Duration::from_millis(50)).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn faulting_predicate_keeps_partial_collection() {
        let bus = Arc::new(EventBus::new());
        let collector = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                collect_matches(
                    &bus,
                    |e: &u32| {
                        if *e == 13 {
                            panic!("predicate bug");
                        }
                        true
                    },
                    Duration::from_millis(60),
                )
                .await
            })
        };
        tokio::task::yield_now().await;

        for event in [1u32, 13, 7] {
            bus.publish(&event, &DispatchPolicy::default()).await.unwrap();
        }
        // Collection stopped at the fault; the partial set survives.
        assert_eq!(collector.await.unwrap(), vec![1]);
    }
}
