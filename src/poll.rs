//! Bounded busy-polling with cancellation.
//!
//! Every wait in the control plane (core done bits, DMA queue drain, DMA
//! idle, timer-based delays) runs through a [`Poller`]. The default
//! [`PollPolicy`] is unbounded, which matches the hardware contract: the
//! awaited state is expected to arrive eventually. Hosts that cannot
//! tolerate a stuck wait either bound the poll count or fire a
//! [`CancelToken`] from another thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{CtrlError, Result};

/// How long and how often to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PollPolicy {
    /// Give up after this many unsuccessful polls. `None` polls forever.
    pub max_polls: Option<u64>,
    /// Sleep between polls, in microseconds. Zero spins.
    pub interval_us: u64,
}

impl PollPolicy {
    /// Poll forever without sleeping.
    pub const UNBOUNDED: Self = Self { max_polls: None, interval_us: 0 };

    /// Give up after `n` polls.
    pub fn bounded(n: u64) -> Self {
        Self { max_polls: Some(n), interval_us: 0 }
    }
}

/// Shared flag that aborts in-progress waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Re-arm the token after a cancellation has been handled.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One polling loop's limits.
#[derive(Debug, Clone, Copy)]
pub struct Poller<'a> {
    policy: PollPolicy,
    cancel: Option<&'a CancelToken>,
    deadline: Option<Instant>,
}

impl<'a> Poller<'a> {
    pub fn new(policy: PollPolicy, cancel: Option<&'a CancelToken>) -> Self {
        Self { policy, cancel, deadline: None }
    }

    /// Also stop at a wall-clock deadline.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Call `f` until it yields a value.
    ///
    /// `what` names the wait in timeout and cancellation errors.
    pub fn poll<T>(&self, what: &str, mut f: impl FnMut() -> Result<Option<T>>) -> Result<T> {
        let mut polls: u64 = 0;
        loop {
            if let Some(value) = f()? {
                if polls > 0 {
                    log::trace!("{} ready after {} polls", what, polls);
                }
                return Ok(value);
            }
            polls += 1;

            if self.cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(CtrlError::Cancelled(what.to_string()));
            }
            if let Some(max) = self.policy.max_polls {
                if polls >= max {
                    return Err(CtrlError::Timeout(format!("{} after {} polls", what, polls)));
                }
            }
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(CtrlError::Timeout(what.to_string()));
                }
            }

            if self.policy.interval_us > 0 {
                std::thread::sleep(Duration::from_micros(self.policy.interval_us));
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_poll_until_ready() {
        let poller = Poller::new(PollPolicy::UNBOUNDED, None);
        let mut n = 0;
        let v = poller
            .poll("counting", || {
                n += 1;
                Ok((n == 5).then_some(n))
            })
            .unwrap();
        assert_eq!(v, 5);
    }

    #[test]
    fn test_poll_bound() {
        let poller = Poller::new(PollPolicy::bounded(3), None);
        let mut calls = 0;
        let err = poller
            .poll::<()>("never", || {
                calls += 1;
                Ok(None)
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_poll_cancel() {
        let token = CancelToken::new();
        token.cancel();
        let poller = Poller::new(PollPolicy::UNBOUNDED, Some(&token));
        let err = poller.poll::<()>("stuck", || Ok(None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        token.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_poll_deadline() {
        let poller = Poller::new(PollPolicy::UNBOUNDED, None).with_deadline(Some(Instant::now()));
        let err = poller.poll::<()>("late", || Ok(None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_poll_propagates_errors() {
        let poller = Poller::new(PollPolicy::UNBOUNDED, None);
        let err = poller
            .poll::<()>("failing", || Err(CtrlError::user("boom")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
    }
}
