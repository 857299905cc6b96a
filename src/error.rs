use std::fmt;

/// Outcome of a failed channel operation.
///
/// Every variant is local to the promise of the operation that produced it:
/// retiring one channel never poisons another, and a selector's returned
/// error always carries the outcome of whichever branch actually ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel was already retired, or retired while this operation was pending.
    Retired,
    /// The deadline elapsed before a match was found.
    Timeout,
    /// Withdrawn by the caller's own offer handle: the losing branch of a
    /// selection, or an overflow victim under a drop policy.
    Cancelled,
    /// A queue bound was exceeded under the `reject` overflow policy.
    Overflow,
    /// The channel or selection was constructed with contradictory options.
    InvalidArgument(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Retired => write!(f, "channel is retired"),
            ChannelError::Timeout => write!(f, "operation timed out"),
            ChannelError::Cancelled => write!(f, "operation cancelled"),
            ChannelError::Overflow => write!(f, "pending queue overflow"),
            ChannelError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Errors surfaced by the scope and name registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    /// `inject_from_parent` referenced a name no ancestor frame binds.
    UnknownInjection(String),
    /// `inject_from_parent` was called on a frame that is not isolated.
    NotIsolated,
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeError::UnknownInjection(name) => {
                write!(f, "no ancestor frame binds channel {name:?}")
            }
            ScopeError::NotIsolated => write!(f, "frame is not isolated"),
        }
    }
}

impl std::error::Error for ScopeError {}

pub type Result<T> = std::result::Result<T, ChannelError>;
