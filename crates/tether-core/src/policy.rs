use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;

use crate::fault::DispatchFault;

bitflags! {
    /// Bitmask selecting how dispatch faults are surfaced.
    ///
    /// "Fatal" means the handler returned an error; "non-fatal" means it
    /// exceeded the dispatch budget. "Handle" invokes the fault hook
    /// synchronously and never propagates; "throw" accumulates faults and
    /// raises one aggregate error after all handlers ran.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ErrorPolicy: u8 {
        const THROW_FATAL = 1 << 0;
        const THROW_NON_FATAL = 1 << 1;
        const HANDLE_FATAL = 1 << 2;
        const HANDLE_NON_FATAL = 1 << 3;
    }
}

impl Default for ErrorPolicy {
    /// Handle both, throw neither.
    fn default() -> Self {
        Self::HANDLE_FATAL | Self::HANDLE_NON_FATAL
    }
}

/// Synchronous callback invoked for each fault under a handle policy.
pub type FaultHook = Arc<dyn Fn(&DispatchFault) + Send + Sync>;

/// Per-publish dispatch policy: error bitmask, optional time budget, and an
/// optional fault hook. Passed explicitly per publish call; never stored as
/// mutable bus state.
#[derive(Clone, Default)]
pub struct DispatchPolicy {
    pub policy: ErrorPolicy,
    /// Total time budget for the whole dispatch. The timer starts at
    /// dispatch entry and is never restarted for later handlers.
    pub budget: Option<Duration>,
    pub on_fault: Option<FaultHook>,
}

impl DispatchPolicy {
    pub fn new(policy: ErrorPolicy) -> Self {
        Self {
            policy,
            budget: None,
            on_fault: None,
        }
    }

    /// Throw everything, handle nothing. Strictly opt-in.
    pub fn throw_all() -> Self {
        Self::new(ErrorPolicy::THROW_FATAL | ErrorPolicy::THROW_NON_FATAL)
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_fault_hook(mut self, hook: FaultHook) -> Self {
        self.on_fault = Some(hook);
        self
    }

    pub fn should_handle(&self, fault: &DispatchFault) -> bool {
        if fault.is_fatal() {
            self.policy.contains(ErrorPolicy::HANDLE_FATAL)
        } else {
            self.policy.contains(ErrorPolicy::HANDLE_NON_FATAL)
        }
    }

    pub fn should_throw(&self, fault: &DispatchFault) -> bool {
        if fault.is_fatal() {
            self.policy.contains(ErrorPolicy::THROW_FATAL)
        } else {
            self.policy.contains(ErrorPolicy::THROW_NON_FATAL)
        }
    }
}

impl fmt::Debug for DispatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPolicy")
            .field("policy", &self.policy)
            .field("budget", &self.budget)
            .field("on_fault", &self.on_fault.is_some())
            .finish()
    }
}
