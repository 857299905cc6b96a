use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::ChannelError;

/// The resolve-once promise cell backing every [`read`](crate::Channel::read)
/// and [`write`](crate::Channel::write) call.
///
/// A `Completion` is created synchronously by the call that spawned it and
/// handed to the matching algorithm under the channel lock; the algorithm
/// either resolves it immediately (the fast path) or stores it on a queued
/// reader/writer entry to be resolved later by a matching peer, a timeout,
/// or retirement. [`resolve`](Completion::resolve)
/// is idempotent, which is what lets draining code call it defensively on
/// entries that may already be settled.
pub(crate) struct Completion<T> {
    inner: Arc<Mutex<State<T>>>,
}

struct State<T> {
    result: Option<Result<T, ChannelError>>,
    waker: Option<Waker>,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                result: None,
                waker: None,
            })),
        }
    }

    /// Resolves this completion, waking the polling task if one has
    /// registered. A second call is a silent no-op: invariant 3 requires a
    /// completion resolve exactly once, and callers (notably retirement
    /// drains) cannot always tell whether a given entry already settled.
    pub(crate) fn resolve(&self, result: Result<T, ChannelError>) {
        let mut state = self.inner.lock();
        if state.result.is_some() {
            return;
        }
        state.result = Some(result);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Non-blocking peek used by the fast path and by the selector to tell
    /// a synchronous match from one that had to park.
    pub(crate) fn try_take(&self) -> Option<Result<T, ChannelError>> {
        self.inner.lock().result.take()
    }

    pub(crate) fn future(&self) -> CompletionFuture<T> {
        CompletionFuture {
            inner: self.inner.clone(),
        }
    }

    /// Identity comparison, used by callers (e.g. the broadcast variant)
    /// that need to find "this exact pending entry" in a queue without a
    /// dedicated index, such as when removing an immediate-deadline probe
    /// that failed to resolve synchronously.
    pub(crate) fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// The future a caller actually awaits. Not cancel-safe in the sense that
/// dropping it before it resolves does not withdraw the entry it backs —
/// callers that need that must cancel through an [`OfferHandle`](crate::OfferHandle).
#[must_use = "futures do nothing unless polled"]
pub(crate) struct CompletionFuture<T> {
    inner: Arc<Mutex<State<T>>>,
}

impl<T> Unpin for CompletionFuture<T> {}

impl<T> Future for CompletionFuture<T> {
    type Output = Result<T, ChannelError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.lock();
        if let Some(result) = state.result.take() {
            return Poll::Ready(result);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}
