//! Process-wide, monotonic shutdown signalling.
//!
//! Several independent tasks (a signal handler, the termination monitor) may
//! all decide the process should stop; the first one wins and the reason is
//! never overwritten, so the job executor can always ask "why are we
//! stopping" once and get a stable answer.

use std::sync::atomic::{AtomicU8, Ordering};

/// Why the shutdown latch was set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An operator-initiated `SIGTERM`.
    Sigterm,
    /// IMDS reported an imminent spot interruption.
    SpotInterruption,
    /// IMDS reported a spot rebalance recommendation.
    SpotRebalance,
    /// The auto-scaling group is taking this instance out of service.
    AsgTermination,
}

impl ShutdownReason {
    /// Stable string used in `requeue`/`deregister` request bodies.
    pub fn as_wire_str(self) -> &'static str {
        match self {
            ShutdownReason::Sigterm => "sigterm",
            ShutdownReason::SpotInterruption => "spot_interruption",
            ShutdownReason::SpotRebalance => "spot_rebalance",
            ShutdownReason::AsgTermination => "asg_termination",
        }
    }

    /// Whether this reason means "the platform is about to take the instance
    /// away from us", as opposed to an operator-initiated stop.
    pub fn is_preemption(self) -> bool {
        !matches!(self, ShutdownReason::Sigterm)
    }

    fn to_tag(self) -> u8 {
        match self {
            ShutdownReason::Sigterm => 1,
            ShutdownReason::SpotInterruption => 2,
            ShutdownReason::SpotRebalance => 3,
            ShutdownReason::AsgTermination => 4,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ShutdownReason::Sigterm),
            2 => Some(ShutdownReason::SpotInterruption),
            3 => Some(ShutdownReason::SpotRebalance),
            4 => Some(ShutdownReason::AsgTermination),
            _ => None,
        }
    }
}

const NOT_SET: u8 = 0;

/// A monotonic, thread-safe "are we shutting down, and why" flag.
///
/// `set` is a compare-exchange against the sentinel `NOT_SET` value, so the
/// first caller to set a reason wins; every later call is a no-op.
#[derive(Debug, Default)]
pub struct ShutdownLatch {
    tag: AtomicU8,
}

impl ShutdownLatch {
    /// Creates an unset latch.
    pub fn new() -> Self {
        Self {
            tag: AtomicU8::new(NOT_SET),
        }
    }

    /// Attempts to set the latch to `reason`. Returns `true` iff this call
    /// was the one that set it (i.e. the latch was previously unset).
    pub fn set(&self, reason: ShutdownReason) -> bool {
        self.tag
            .compare_exchange(
                NOT_SET,
                reason.to_tag(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Whether any reason has been set.
    pub fn is_set(&self) -> bool {
        self.tag.load(Ordering::Acquire) != NOT_SET
    }

    /// The reason the latch was set, if any.
    pub fn reason(&self) -> Option<ShutdownReason> {
        ShutdownReason::from_tag(self.tag.load(Ordering::Acquire))
    }

    /// True once a reason has been set that means the platform is reclaiming
    /// capacity, as opposed to a plain operator-initiated stop.
    pub fn is_preemption(&self) -> bool {
        self.reason().is_some_and(ShutdownReason::is_preemption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_set_wins() {
        let latch = ShutdownLatch::new();
        assert!(!latch.is_set());
        assert!(latch.set(ShutdownReason::SpotInterruption));
        assert!(latch.is_set());
        assert_eq!(latch.reason(), Some(ShutdownReason::SpotInterruption));

        // A later call with a different reason must not override it.
        assert!(!latch.set(ShutdownReason::AsgTermination));
        assert_eq!(latch.reason(), Some(ShutdownReason::SpotInterruption));
    }

    #[test]
    fn sigterm_is_not_preemption() {
        let latch = ShutdownLatch::new();
        latch.set(ShutdownReason::Sigterm);
        assert!(!latch.is_preemption());
    }

    #[test]
    fn spot_reasons_are_preemption() {
        for reason in [
            ShutdownReason::SpotInterruption,
            ShutdownReason::SpotRebalance,
            ShutdownReason::AsgTermination,
        ] {
            let latch = ShutdownLatch::new();
            latch.set(reason);
            assert!(latch.is_preemption());
        }
    }
}
