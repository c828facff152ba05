use std::time::Duration;

/// One fault raised by a single handler during a dispatch.
///
/// `Faulted` (the handler returned an error) is fatal; `TimedOut` (the
/// handler exceeded the dispatch budget) is non-fatal by convention.
#[derive(Debug, thiserror::Error)]
pub enum DispatchFault {
    #[error("handler {handler} faulted: {error}")]
    Faulted { handler: usize, error: anyhow::Error },

    #[error("handler {handler} exceeded the dispatch budget of {budget:?}")]
    TimedOut { handler: usize, budget: Duration },
}

impl DispatchFault {
    /// Index of the faulting handler in the dispatch snapshot.
    pub fn handler(&self) -> usize {
        match self {
            Self::Faulted { handler, .. } | Self::TimedOut { handler, .. } => *handler,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Faulted { .. })
    }

    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Faulted { .. } => "faulted",
            Self::TimedOut { .. } => "timed_out",
        }
    }
}

/// Aggregate failure raised after all handlers ran, under a throw policy.
#[derive(Debug, thiserror::Error)]
#[error("dispatch raised {} fault(s)", .faults.len())]
pub struct DispatchError {
    pub faults: Vec<DispatchFault>,
}

impl DispatchError {
    pub fn new(faults: Vec<DispatchFault>) -> Self {
        Self { faults }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_classification() {
        let fatal = DispatchFault::Faulted {
            handler: 2,
            error: anyhow::anyhow!("boom"),
        };
        assert!(fatal.is_fatal());
        assert_eq!(fatal.handler(), 2);
        assert_eq!(fatal.kind(), "faulted");

        let timeout = DispatchFault::TimedOut {
            handler: 0,
            budget: Duration::from_millis(50),
        };
        assert!(!timeout.is_fatal());
        assert_eq!(timeout.kind(), "timed_out");
    }

    #[test]
    fn aggregate_display_counts_faults() {
        let err = DispatchError::new(vec![
            DispatchFault::Faulted {
                handler: 0,
                error: anyhow::anyhow!("a"),
            },
            DispatchFault::TimedOut {
                handler: 1,
                budget: Duration::from_millis(10),
            },
        ]);
        assert_eq!(err.to_string(), "dispatch raised 2 fault(s)");
    }
}
