use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Cross-session admission limiter for identify/handshake operations.
///
/// Enforces a fixed pool of `max_concurrency` permits plus a minimum reuse
/// spacing per permit. Both values are supplied by the remote service at
/// session start and hold for the limiter's lifetime.
pub struct IdentifyLimiter {
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    cooldown: Duration,
}

impl IdentifyLimiter {
    pub fn new(max_concurrency: usize, cooldown: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            cooldown,
        }
    }

    /// Wait for and consume a permit. The permit returns to the pool only
    /// through the ticket: a scheduled release, or dropping the ticket.
    pub async fn acquire(&self) -> IdentifyTicket {
        // The semaphore is owned by this limiter and never closed.
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
        IdentifyTicket {
            permits: Arc::clone(&self.permits),
            cooldown: self.cooldown,
            returned: Arc::new(AtomicBool::new(false)),
            timer: None,
        }
    }

    /// Wait until a permit is available without consuming it.
    pub async fn wait(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            drop(permit);
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

/// One consumed permit. Exactly one return per ticket, whichever path runs
/// first: an armed release timer, an immediate release, or drop.
pub struct IdentifyTicket {
    permits: Arc<Semaphore>,
    cooldown: Duration,
    returned: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl IdentifyTicket {
    /// Arm a delayed return of this permit after the limiter's configured
    /// cooldown, so the caller is not blocked waiting it out.
    pub fn release(&mut self) {
        self.release_after(self.cooldown);
    }

    /// Arm a delayed return of this permit. A fresh call replaces any timer
    /// already armed for it. When the pool is not currently exhausted there
    /// is nothing meaningful to delay and the permit returns immediately.
    pub fn release_after(&mut self, after: Duration) {
        if self.returned.load(Ordering::Acquire) {
            return;
        }
        if let Some(old) = self.timer.take() {
            old.abort();
        }
        if self.permits.available_permits() > 0 {
            return_permit(&self.permits, &self.returned);
            return;
        }

        debug!(after_ms = after.as_millis() as u64, "identify permit release armed");
        let permits = Arc::clone(&self.permits);
        let returned = Arc::clone(&self.returned);
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            return_permit(&permits, &returned);
        }));
    }
}

impl Drop for IdentifyTicket {
    fn drop(&mut self) {
        // An armed timer keeps running detached and returns the permit
        // itself; otherwise the drop returns it right away.
        if self.timer.is_none() {
            return_permit(&self.permits, &self.returned);
        }
    }
}

fn return_permit(permits: &Semaphore, returned: &AtomicBool) {
    if returned
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        permits.add_permits(1);
    }
}
