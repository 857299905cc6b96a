//! The channel kernel: per-channel reader/writer queues, the two-phase-commit
//! matching algorithm, buffering, and retirement.
//!
//! ## How it works
//!
//! ```text
//! writer queue: [ Buffered(v0) | Buffered(v1) | Blocked(v2) | Blocked(v3) ]
//!                \____________________________/ \______________________/
//!                   already returned success         still parked,
//!                   to their writers (≤ B of them)    waiting for a reader
//! ```
//!
//! A `read` walks the writer queue head-first, consuming `Buffered` slots
//! without touching anyone's offer but the reader's own, and running the
//! full offer/commit/withdraw dance against `Blocked` slots since a real
//! writer is still waiting there. A `write` is the mirror: it walks the
//! reader queue first, and only falls back to buffering (or blocking) once
//! no reader is available. See [`inner`] for the algorithm itself.
//!
//! No channel lock is ever held while acquiring another channel's lock;
//! [`OfferHandle`](crate::OfferHandle) implementations are required to only
//! touch lock-free state of their own, which is what makes the
//! [selector](crate::select) safe to compose across channels.

pub(crate) mod completion;
pub(crate) mod config;
pub(crate) mod inner;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pub use config::{ChannelConfig, OverflowPolicy};

use crate::deadline::Deadline;
use crate::error::{ChannelError, Result};
use crate::offer::Offer;
use crate::timer::ExpirationManager;
use completion::CompletionFuture;
use inner::{ChannelInner, MatchOutcome};

/// A typed, rendezvous-or-buffered message-passing channel.
///
/// Cloning a `Channel` shares the same underlying kernel instance; channels
/// are meant to be handed freely across tasks.
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> PartialEq for Channel<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl<T> Eq for Channel<T> {}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Builds a new channel from `config`, registering its deadlines with
    /// the process-wide [`ExpirationManager`].
    pub fn new(config: ChannelConfig) -> Result<Self> {
        Ok(Self {
            inner: ChannelInner::new(config, ExpirationManager::global())?,
        })
    }

    pub(crate) fn from_inner(inner: Arc<ChannelInner<T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ChannelInner<T>> {
        &self.inner
    }

    /// Attempts to read a value, optionally vetoable through `handle` (as
    /// the [selector](crate::select) does) and bounded by `deadline`.
    pub fn read(&self, handle: Option<Offer>, deadline: Deadline) -> ReadFuture<T> {
        match self.inner.read(handle, deadline) {
            MatchOutcome::Done(result) => ReadFuture::done(result),
            MatchOutcome::Pending(fut) => ReadFuture::pending(fut),
        }
    }

    /// Attempts to write `value`, optionally vetoable through `handle` and
    /// bounded by `deadline`.
    pub fn write(&self, value: T, handle: Option<Offer>, deadline: Deadline) -> WriteFuture {
        match self.inner.write(value, handle, deadline) {
            MatchOutcome::Done(result) => WriteFuture::done(result),
            MatchOutcome::Pending(fut) => WriteFuture::pending(fut),
        }
    }

    /// Begins graceful retirement. With `immediate = false`, buffered
    /// writes that already returned success are still delivered to readers
    /// before the channel fully retires (see §4.3 of the design docs); with
    /// `immediate = true` the channel retires right away.
    pub fn retire(&self, immediate: bool) {
        self.inner.retire(immediate);
    }

    pub fn is_retired(&self) -> bool {
        self.inner.is_retired()
    }

    pub fn last_read_tick(&self) -> u64 {
        self.inner.last_read_tick()
    }

    pub fn last_write_tick(&self) -> u64 {
        self.inner.last_write_tick()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Number of values currently buffered (already returned success to
    /// their writer, not yet observed by a reader).
    pub fn len(&self) -> usize {
        self.inner.buffered_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates a new channel. Thin wrapper over [`Channel::new`] matching the
/// abstract `new_channel<T>(...)` factory.
pub fn new_channel<T: Send + 'static>(config: ChannelConfig) -> Result<Channel<T>> {
    Channel::new(config)
}

enum FutureState<V> {
    Done(Option<Result<V>>),
    Pending(CompletionFuture<V>),
}

impl<V> FutureState<V> {
    fn done(result: Result<V>) -> Self {
        FutureState::Done(Some(result))
    }

    fn try_done(&mut self) -> Option<Result<V>> {
        match self {
            FutureState::Done(slot) => slot.take(),
            FutureState::Pending(_) => None,
        }
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Result<V>> {
        match self {
            FutureState::Done(slot) => Poll::Ready(slot.take().expect("polled after completion")),
            FutureState::Pending(fut) => Pin::new(fut).poll(cx),
        }
    }
}

/// The future returned by [`Channel::read`]. Resolves synchronously if a
/// match was found under the lock (the fast path); otherwise parks until a
/// matching peer, a timeout, or retirement resolves it.
#[must_use = "futures do nothing unless polled"]
pub struct ReadFuture<T> {
    state: FutureState<T>,
}

impl<T> ReadFuture<T> {
    fn done(result: Result<T>) -> Self {
        Self { state: FutureState::done(result) }
    }

    fn pending(fut: CompletionFuture<T>) -> Self {
        Self { state: FutureState::Pending(fut) }
    }

    /// Non-blocking: `Some` if this call already resolved synchronously.
    /// Used by [`read_from_any`](crate::select::read_from_any) to tell a
    /// synchronous match from one that had to park.
    pub(crate) fn try_done(&mut self) -> Option<Result<T>> {
        self.state.try_done()
    }
}

impl<T> Unpin for ReadFuture<T> {}

impl<T> Future for ReadFuture<T> {
    type Output = Result<T>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.state.poll(cx)
    }
}

/// The future returned by [`Channel::write`]; mirrors [`ReadFuture`] but
/// resolves to `()` on success.
#[must_use = "futures do nothing unless polled"]
pub struct WriteFuture {
    state: FutureState<()>,
}

impl WriteFuture {
    fn done(result: Result<()>) -> Self {
        Self { state: FutureState::done(result) }
    }

    fn pending(fut: CompletionFuture<()>) -> Self {
        Self { state: FutureState::Pending(fut) }
    }

    pub(crate) fn try_done(&mut self) -> Option<Result<()>> {
        self.state.try_done()
    }
}

impl Unpin for WriteFuture {}

impl Future for WriteFuture {
    type Output = Result<()>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.state.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;

    fn rendezvous<T: Send + 'static>() -> Channel<T> {
        Channel::new(ChannelConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn ping_pong_on_a_rendezvous_channel() {
        let c = rendezvous::<&'static str>();
        let writer = {
            let c = c.clone();
            tokio::spawn(async move { c.write("hello", None, Deadline::Infinite).await })
        };
        let received = c.read(None, Deadline::Infinite).await.unwrap();
        assert_eq!(received, "hello");
        writer.await.unwrap().unwrap();
        assert!(c.last_read_tick() >= c.last_write_tick());
    }

    #[tokio::test]
    async fn immediate_deadline_on_empty_channel_times_out() {
        let c = rendezvous::<i32>();
        let result = c.read(None, Deadline::Immediate).await;
        assert_eq!(result, Err(ChannelError::Timeout));
    }

    #[tokio::test]
    async fn buffered_write_returns_before_any_reader_arrives() {
        let c = Channel::<i32>::new(ChannelConfig::default().with_buffer(2)).unwrap();
        c.write(1, None, Deadline::Immediate).await.unwrap();
        c.write(2, None, Deadline::Immediate).await.unwrap();
        assert_eq!(c.write(3, None, Deadline::Immediate).await, Err(ChannelError::Timeout));
        assert_eq!(c.read(None, Deadline::Immediate).await.unwrap(), 1);
        assert_eq!(c.read(None, Deadline::Immediate).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn overflow_reject_on_a_full_pending_writer_queue() {
        let c = Channel::<i32>::new(
            ChannelConfig::default()
                .with_max_pending_writers(Some(1))
                .with_writer_overflow(OverflowPolicy::Reject),
        )
        .unwrap();
        let c2 = c.clone();
        let blocked = tokio::spawn(async move { c2.write(1, None, Deadline::Infinite).await });
        tokio::task::yield_now().await;
        let second = c.write(2, None, Deadline::Immediate).await;
        assert_eq!(second, Err(ChannelError::Overflow));
        blocked.abort();
    }

    #[tokio::test]
    async fn retiring_an_empty_channel_then_reading_yields_retired() {
        let c = rendezvous::<i32>();
        c.retire(false);
        assert!(c.is_retired());
        assert_eq!(c.read(None, Deadline::Immediate).await, Err(ChannelError::Retired));
    }

    #[tokio::test]
    async fn buffered_retire_drains_exactly_the_returned_writes() {
        let c = Channel::<i32>::new(ChannelConfig::default().with_buffer(2)).unwrap();
        c.write(1, None, Deadline::Immediate).await.unwrap();
        c.write(2, None, Deadline::Immediate).await.unwrap();
        let c2 = c.clone();
        let third = tokio::spawn(async move { c2.write(3, None, Deadline::Infinite).await });
        tokio::task::yield_now().await;

        c.retire(false);

        assert_eq!(c.read(None, Deadline::Immediate).await.unwrap(), 1);
        assert_eq!(c.read(None, Deadline::Immediate).await.unwrap(), 2);
        assert_eq!(c.read(None, Deadline::Immediate).await.unwrap(), 3);
        third.await.unwrap().unwrap();
        assert_eq!(c.read(None, Deadline::Immediate).await, Err(ChannelError::Retired));
        assert!(c.is_retired());
    }

    #[tokio::test]
    async fn last_write_tick_is_monotonic() {
        let c = Channel::<i32>::new(ChannelConfig::default().with_buffer(4)).unwrap();
        let mut prev = c.last_write_tick();
        for v in 0..4 {
            c.write(v, None, Deadline::Immediate).await.unwrap();
            let now = c.last_write_tick();
            assert!(now > prev);
            prev = now;
        }
    }
}
