use std::time::Duration;
use tokio::time::Instant;

/// When an operation should give up waiting for a match.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    /// A zero-duration probe: match now or fail with [`Timeout`](crate::ChannelError::Timeout).
    Immediate,
    /// Never time out; wait for a match, cancellation, or retirement.
    Infinite,
    /// Time out after the given duration.
    After(Duration),
}

impl Deadline {
    /// Shorthand for [`Deadline::After(Duration::from_millis(ms))`](Deadline::After).
    pub fn ms(ms: u64) -> Self {
        Deadline::After(Duration::from_millis(ms))
    }

    /// Shorthand for [`Deadline::After(Duration::from_secs(secs))`](Deadline::After).
    pub fn secs(secs: u64) -> Self {
        Deadline::After(Duration::from_secs(secs))
    }

    /// Resolves this deadline against the current instant.
    ///
    /// `Immediate` resolves to a point already elapsed, so any caller racing
    /// it against `Instant::now()` after resolution sees it as due.
    pub(crate) fn resolve(self) -> ResolvedDeadline {
        match self {
            Deadline::Immediate => ResolvedDeadline::Immediate,
            Deadline::Infinite => ResolvedDeadline::Infinite,
            Deadline::After(duration) => ResolvedDeadline::At(Instant::now() + duration),
        }
    }
}

/// A deadline anchored to a concrete point in time, as stored on a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolvedDeadline {
    Immediate,
    Infinite,
    At(Instant),
}

impl ResolvedDeadline {
    pub(crate) fn is_immediate(&self) -> bool {
        matches!(self, ResolvedDeadline::Immediate)
    }

    /// The absolute instant to register with the expiration manager, if any.
    pub(crate) fn instant(&self) -> Option<Instant> {
        match self {
            ResolvedDeadline::At(instant) => Some(*instant),
            ResolvedDeadline::Immediate | ResolvedDeadline::Infinite => None,
        }
    }

    pub(crate) fn has_elapsed(&self, now: Instant) -> bool {
        match self {
            ResolvedDeadline::At(instant) => *instant <= now,
            ResolvedDeadline::Immediate => true,
            ResolvedDeadline::Infinite => false,
        }
    }
}
