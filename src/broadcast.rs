//! The broadcast channel variant: one write delivered to every currently
//! registered reader, atomically.
//!
//! Unlike [`Channel`](crate::Channel), a broadcast write is never buffered —
//! there is no value sitting in a slot waiting to be observed. Instead a
//! write blocks until enough readers have joined (`initial_barrier` before
//! the very first delivery, `minimum` for every one after), then offers the
//! same value to every joined reader at once. If any reader vetoes, the
//! whole write vetoes: nothing is delivered, and the vetoing reader alone is
//! dropped from the queue (the same "a `false` offer means its originator
//! chose to leave" rule the single-channel kernel uses).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::channel::completion::{Completion, CompletionFuture};
use crate::deadline::{Deadline, ResolvedDeadline};
use crate::error::{ChannelError, Result};
use crate::offer::{Offer, null_offer};
use crate::timer::{ExpirableChannel, ExpirationManager};

/// Construction-time parameters for a [`BroadcastChannel`].
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub name: Option<String>,
    /// Minimum readers that must have joined before the very first write
    /// may proceed.
    pub initial_barrier: usize,
    /// Minimum readers required for every write after the first.
    pub minimum: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            name: None,
            initial_barrier: 1,
            minimum: 1,
        }
    }
}

impl BroadcastConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_initial_barrier(mut self, n: usize) -> Self {
        self.initial_barrier = n;
        self
    }

    pub fn with_minimum(mut self, n: usize) -> Self {
        self.minimum = n;
        self
    }
}

struct ReaderEntry<T> {
    offer: Offer,
    completion: Completion<T>,
    deadline: ResolvedDeadline,
}

struct PendingWrite<T> {
    offer: Offer,
    completion: Completion<()>,
    deadline: ResolvedDeadline,
    value: T,
}

enum RetireState {
    Active,
    Retired,
}

struct State<T> {
    readers: VecDeque<ReaderEntry<T>>,
    writes: VecDeque<PendingWrite<T>>,
    delivered_once: bool,
    retirement: RetireState,
    last_write_tick: u64,
}

pub(crate) enum MatchOutcome<V> {
    Done(Result<V>),
    Pending(CompletionFuture<V>),
}

struct Inner<T> {
    name: Option<String>,
    initial_barrier: usize,
    minimum: usize,
    state: Mutex<State<T>>,
    timer: Arc<ExpirationManager>,
    self_weak: Weak<Inner<T>>,
}

impl<T: Clone + Send + 'static> Inner<T> {
    fn register_deadline(&self, instant: Instant) {
        let id = self.self_weak.as_ptr() as *const () as usize;
        self.timer.register(id, instant, self.self_weak.clone());
    }

    /// Tries to drive the front of the write queue forward: if enough
    /// readers have joined, offers the pending value to every one of them
    /// plus the writer's own handle. Commits all-or-nothing on success;
    /// drops exactly the reader that vetoed on failure and retries, since a
    /// veto is that reader electing to leave, not the write's problem.
    fn attempt_broadcast(&self, g: &mut State<T>) {
        loop {
            let required = if g.delivered_once { self.minimum } else { self.initial_barrier };
            if g.readers.len() < required {
                return;
            }
            let Some(write) = g.writes.front() else { return };

            let mut accepted = 0usize;
            let mut veto_at = None;
            for r in g.readers.iter() {
                if r.offer.offer() {
                    accepted += 1;
                } else {
                    veto_at = Some(accepted);
                    break;
                }
            }

            if let Some(veto_idx) = veto_at {
                for r in g.readers.iter().take(accepted) {
                    r.offer.withdraw();
                }
                let vetoed = g.readers.remove(veto_idx).unwrap();
                vetoed.completion.resolve(Err(ChannelError::Cancelled));
                continue;
            }

            if !write.offer.offer() {
                for r in g.readers.iter().take(accepted) {
                    r.offer.withdraw();
                }
                let pending = g.writes.pop_front().unwrap();
                pending.completion.resolve(Err(ChannelError::Cancelled));
                continue;
            }

            for r in g.readers.iter().take(accepted) {
                r.offer.commit();
            }
            write.offer.commit();
            let pending = g.writes.pop_front().unwrap();
            let delivered: Vec<_> = g.readers.drain(..accepted).collect();
            for r in delivered {
                r.completion.resolve(Ok(pending.value.clone()));
            }
            pending.completion.resolve(Ok(()));
            g.delivered_once = true;
            g.last_write_tick += 1;
            trace!(channel = ?self.name, readers = accepted, "broadcast delivered to all joined readers");
        }
    }

    fn scan_expired(&self, now: Instant) {
        let mut g = self.state.lock();
        if matches!(g.retirement, RetireState::Retired) {
            return;
        }
        let mut next: Option<Instant> = None;
        g.readers.retain(|r| {
            if r.deadline.has_elapsed(now) {
                r.completion.resolve(Err(ChannelError::Timeout));
                false
            } else {
                if let Some(inst) = r.deadline.instant() {
                    next = Some(next.map_or(inst, |n| n.min(inst)));
                }
                true
            }
        });
        g.writes.retain(|w| {
            if w.deadline.has_elapsed(now) {
                w.completion.resolve(Err(ChannelError::Timeout));
                false
            } else {
                if let Some(inst) = w.deadline.instant() {
                    next = Some(next.map_or(inst, |n| n.min(inst)));
                }
                true
            }
        });
        self.attempt_broadcast(&mut g);
        drop(g);
        if let Some(instant) = next {
            self.register_deadline(instant);
        }
    }
}

impl<T: Clone + Send + 'static> ExpirableChannel for Inner<T> {
    fn expire_due(&self, now: Instant) {
        self.scan_expired(now);
    }
}

/// A channel variant that delivers a single write to every currently
/// registered reader, atomically; see the [module docs](self).
pub struct BroadcastChannel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BroadcastChannel<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Clone + Send + 'static> BroadcastChannel<T> {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            inner: Arc::new_cyclic(|weak| Inner {
                name: config.name,
                initial_barrier: config.initial_barrier,
                minimum: config.minimum,
                state: Mutex::new(State {
                    readers: VecDeque::new(),
                    writes: VecDeque::new(),
                    delivered_once: false,
                    retirement: RetireState::Active,
                    last_write_tick: 0,
                }),
                timer: ExpirationManager::global(),
                self_weak: weak.clone(),
            }),
        }
    }

    /// Joins as a reader and waits for the next broadcast. Unlike
    /// [`Channel::read`](crate::Channel::read) there is nothing buffered to
    /// consume immediately; joining *is* the side effect that may unblock a
    /// writer already waiting on the barrier.
    pub fn read(&self, handle: Option<Offer>, deadline: Deadline) -> BroadcastReadFuture<T> {
        let offer = handle.unwrap_or_else(null_offer);
        let resolved = deadline.resolve();
        let mut g = self.inner.state.lock();

        if matches!(g.retirement, RetireState::Retired) {
            return BroadcastReadFuture::done(Err(ChannelError::Retired));
        }

        let completion = Completion::new();
        g.readers.push_back(ReaderEntry {
            offer,
            completion: completion.clone(),
            deadline: resolved,
        });
        self.inner.attempt_broadcast(&mut g);

        if let Some(result) = completion.try_take() {
            return BroadcastReadFuture::done(result);
        }
        if resolved.is_immediate() {
            g.readers.retain(|r| !r.completion.same_as(&completion));
            return BroadcastReadFuture::done(Err(ChannelError::Timeout));
        }
        if let Some(instant) = resolved.instant() {
            drop(g);
            self.inner.register_deadline(instant);
        }
        BroadcastReadFuture::pending(completion.future())
    }

    /// Blocks until enough readers have joined, then delivers `value` to
    /// all of them atomically; fails the whole write if any reader vetoes.
    pub fn write(&self, value: T, handle: Option<Offer>, deadline: Deadline) -> BroadcastWriteFuture {
        let offer = handle.unwrap_or_else(null_offer);
        let resolved = deadline.resolve();
        let mut g = self.inner.state.lock();

        if matches!(g.retirement, RetireState::Retired) {
            return BroadcastWriteFuture::done(Err(ChannelError::Retired));
        }

        let completion = Completion::new();
        g.writes.push_back(PendingWrite {
            offer,
            completion: completion.clone(),
            deadline: resolved,
            value,
        });
        self.inner.attempt_broadcast(&mut g);

        if let Some(result) = completion.try_take() {
            return BroadcastWriteFuture::done(result);
        }
        if resolved.is_immediate() {
            g.writes.retain(|w| !w.completion.same_as(&completion));
            return BroadcastWriteFuture::done(Err(ChannelError::Timeout));
        }
        if let Some(instant) = resolved.instant() {
            drop(g);
            self.inner.register_deadline(instant);
        }
        BroadcastWriteFuture::pending(completion.future())
    }

    /// Retires the channel immediately: broadcasts are never buffered, so
    /// there is no in-flight tail to drain (unlike [`Channel::retire`](crate::Channel::retire)).
    /// Every pending reader and writer resolves with [`Retired`](ChannelError::Retired).
    pub fn retire(&self) {
        let mut g = self.inner.state.lock();
        if matches!(g.retirement, RetireState::Retired) {
            return;
        }
        debug!(channel = ?self.inner.name, "retiring broadcast channel");
        g.retirement = RetireState::Retired;
        for reader in g.readers.drain(..) {
            reader.completion.resolve(Err(ChannelError::Retired));
        }
        for write in g.writes.drain(..) {
            write.completion.resolve(Err(ChannelError::Retired));
        }
    }

    pub fn is_retired(&self) -> bool {
        matches!(self.inner.state.lock().retirement, RetireState::Retired)
    }

    pub fn last_write_tick(&self) -> u64 {
        self.inner.state.lock().last_write_tick
    }

    /// Number of readers currently joined and waiting for the next broadcast.
    pub fn joined_readers(&self) -> usize {
        self.inner.state.lock().readers.len()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }
}

enum FutureState<V> {
    Done(Option<Result<V>>),
    Pending(CompletionFuture<V>),
}

/// The future returned by [`BroadcastChannel::read`].
#[must_use = "futures do nothing unless polled"]
pub struct BroadcastReadFuture<T> {
    state: FutureState<T>,
}

impl<T> BroadcastReadFuture<T> {
    fn done(result: Result<T>) -> Self {
        Self { state: FutureState::Done(Some(result)) }
    }
    fn pending(fut: CompletionFuture<T>) -> Self {
        Self { state: FutureState::Pending(fut) }
    }
}

impl<T> Unpin for BroadcastReadFuture<T> {}

impl<T> Future for BroadcastReadFuture<T> {
    type Output = Result<T>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            FutureState::Done(slot) => Poll::Ready(slot.take().expect("polled after completion")),
            FutureState::Pending(fut) => Pin::new(fut).poll(cx),
        }
    }
}

/// The future returned by [`BroadcastChannel::write`].
#[must_use = "futures do nothing unless polled"]
pub struct BroadcastWriteFuture {
    state: FutureState<()>,
}

impl BroadcastWriteFuture {
    fn done(result: Result<()>) -> Self {
        Self { state: FutureState::Done(Some(result)) }
    }
    fn pending(fut: CompletionFuture<()>) -> Self {
        Self { state: FutureState::Pending(fut) }
    }
}

impl Unpin for BroadcastWriteFuture {}

impl Future for BroadcastWriteFuture {
    type Output = Result<()>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            FutureState::Done(slot) => Poll::Ready(slot.take().expect("polled after completion")),
            FutureState::Pending(fut) => Pin::new(fut).poll(cx),
        }
    }
}
