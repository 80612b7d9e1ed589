//! Coalescing restart request shared by writers and the reconciler.
//!
//! Handlers and the accountant call [`RestartSignal::request`] any number of
//! times; the reconciler drains the signal once per cycle with
//! [`RestartSignal::take`], so a burst of edits costs one restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A drained restart request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRequest {
    /// Restart even if the assembled config equals the running one.
    pub force: bool,
}

#[derive(Debug, Default)]
struct Flags {
    requested: AtomicBool,
    force: AtomicBool,
}

/// Cloneable handle to the restart-needed flags.
#[derive(Debug, Clone, Default)]
pub struct RestartSignal {
    flags: Arc<Flags>,
}

impl RestartSignal {
    /// Creates a signal with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a restart as needed. A forced request stays forced until drained.
    pub fn request(&self, force: bool) {
        if force {
            self.flags.force.store(true, Ordering::SeqCst);
        }
        self.flags.requested.store(true, Ordering::SeqCst);
    }

    /// Drains the pending request, if any.
    pub fn take(&self) -> Option<RestartRequest> {
        self.flags
            .requested
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RestartRequest {
                force: self.flags.force.swap(false, Ordering::SeqCst),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_is_empty_without_request() {
        let signal = RestartSignal::new();
        assert_eq!(signal.take(), None);
    }

    #[test]
    fn burst_coalesces_into_one_request() {
        let signal = RestartSignal::new();
        signal.request(false);
        signal.request(false);
        signal.clone().request(false);
        assert_eq!(signal.take(), Some(RestartRequest { force: false }));
        assert_eq!(signal.take(), None);
    }

    #[test]
    fn force_survives_later_unforced_request() {
        let signal = RestartSignal::new();
        signal.request(true);
        signal.request(false);
        assert_eq!(signal.take(), Some(RestartRequest { force: true }));
        assert_eq!(signal.take(), None);
    }
}
