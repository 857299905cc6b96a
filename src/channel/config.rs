use crate::error::ChannelError;

/// What happens when a pending queue (readers waiting to read, or writers
/// waiting to buffer/rendezvous) would exceed its configured bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Fail the new arrival with [`Overflow`](ChannelError::Overflow).
    Reject,
    /// Evict the head of the queue (resolving it `Cancelled`), then admit the new arrival.
    DropOldest,
    /// Refuse to enqueue; the new arrival resolves `Cancelled`.
    DropNewest,
    /// Evict a uniformly random queued entry (resolving it `Cancelled`), then admit the new arrival.
    DropRandom,
    /// Included for symmetry with the other policies; the reference design
    /// treats both as [`Reject`](OverflowPolicy::Reject).
    BlockSender,
    /// See [`BlockSender`](OverflowPolicy::BlockSender).
    BlockReceiver,
}

/// Construction-time parameters for a [`Channel`](crate::Channel).
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: Option<String>,
    pub buffer: usize,
    pub max_pending_readers: Option<usize>,
    pub max_pending_writers: Option<usize>,
    pub reader_overflow: OverflowPolicy,
    pub writer_overflow: OverflowPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: None,
            buffer: 0,
            max_pending_readers: None,
            max_pending_writers: None,
            reader_overflow: OverflowPolicy::Reject,
            writer_overflow: OverflowPolicy::Reject,
        }
    }
}

impl ChannelConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_max_pending_readers(mut self, max: Option<usize>) -> Self {
        self.max_pending_readers = max;
        self
    }

    pub fn with_max_pending_writers(mut self, max: Option<usize>) -> Self {
        self.max_pending_writers = max;
        self
    }

    pub fn with_reader_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.reader_overflow = policy;
        self
    }

    pub fn with_writer_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.writer_overflow = policy;
        self
    }

    /// Rejects contradictory configurations before a channel is built from them.
    pub(crate) fn validate(&self) -> Result<(), ChannelError> {
        if let Some(max) = self.max_pending_readers
            && max == 0
        {
            return Err(ChannelError::InvalidArgument(
                "max_pending_readers of 0 admits no readers at all; use None to forbid pending readers outright only if that is intended".into(),
            ));
        }
        if let Some(max) = self.max_pending_writers
            && max == 0
        {
            return Err(ChannelError::InvalidArgument(
                "max_pending_writers of 0 admits no writers at all; use None to forbid pending writers outright only if that is intended".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_rendezvous_with_reject_overflow() {
        let config = ChannelConfig::default();
        assert_eq!(config.buffer, 0);
        assert_eq!(config.reader_overflow, OverflowPolicy::Reject);
        assert_eq!(config.writer_overflow, OverflowPolicy::Reject);
    }

    #[test]
    fn zero_max_pending_is_rejected() {
        let config = ChannelConfig::default().with_max_pending_readers(Some(0));
        assert!(config.validate().is_err());
    }
}
