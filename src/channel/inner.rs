use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::channel::completion::Completion;
use crate::channel::config::{ChannelConfig, OverflowPolicy};
use crate::deadline::{Deadline, ResolvedDeadline};
use crate::error::{ChannelError, Result};
use crate::offer::{Offer, null_offer};
use crate::timer::{ExpirableChannel, ExpirationManager};

/// What a pending reader is waiting on.
pub(crate) struct ReaderEntry<T> {
    pub(crate) offer: Offer,
    pub(crate) completion: Completion<T>,
    pub(crate) deadline: ResolvedDeadline,
}

/// A slot in the writer queue: either a value that already returned success
/// to its writer and is waiting to be observed by a reader (`Buffered`), or
/// a writer still blocked because the buffer was full when it arrived
/// (`Blocked`). Invariant 4 of the spec (buffered slots eagerly resolved,
/// the tail blocks) is exactly the claim that `Buffered` entries never
/// follow a `Blocked` one in this queue.
pub(crate) enum WriterSlot<T> {
    Buffered(T),
    Blocked {
        offer: Offer,
        completion: Completion<()>,
        deadline: ResolvedDeadline,
        value: T,
    },
}

pub(crate) enum RetireState {
    Active,
    /// `k` in-flight buffered writes must still be observed by a reader
    /// before the channel is allowed to fully retire.
    Retiring(usize),
    Retired,
}

struct State<T> {
    readers: VecDeque<ReaderEntry<T>>,
    writers: VecDeque<WriterSlot<T>>,
    retirement: RetireState,
    last_read_tick: u64,
    last_write_tick: u64,
}

/// Outcome of attempting a match under the channel lock: either the call
/// completed synchronously, or it had to park a [`Completion`] on a queue.
pub(crate) enum MatchOutcome<V> {
    Done(Result<V>),
    Pending(crate::channel::completion::CompletionFuture<V>),
}

pub(crate) struct ChannelInner<T> {
    pub(crate) name: Option<String>,
    pub(crate) buffer: usize,
    pub(crate) max_pending_readers: Option<usize>,
    pub(crate) max_pending_writers: Option<usize>,
    pub(crate) reader_overflow: OverflowPolicy,
    pub(crate) writer_overflow: OverflowPolicy,
    state: Mutex<State<T>>,
    timer: Arc<ExpirationManager>,
    self_weak: Weak<ChannelInner<T>>,
}

impl<T: Send + 'static> ChannelInner<T> {
    pub(crate) fn new(config: ChannelConfig, timer: Arc<ExpirationManager>) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|weak| ChannelInner {
            name: config.name,
            buffer: config.buffer,
            max_pending_readers: config.max_pending_readers,
            max_pending_writers: config.max_pending_writers,
            reader_overflow: config.reader_overflow,
            writer_overflow: config.writer_overflow,
            state: Mutex::new(State {
                readers: VecDeque::new(),
                writers: VecDeque::new(),
                retirement: RetireState::Active,
                last_read_tick: 0,
                last_write_tick: 0,
            }),
            timer,
            self_weak: weak.clone(),
        }))
    }

    fn register_deadline(&self, instant: Instant) {
        let id = self.self_weak.as_ptr() as *const () as usize;
        self.timer.register(id, instant, self.self_weak.clone());
    }

    pub(crate) fn write(&self, value: T, offer: Option<Offer>, deadline: Deadline) -> MatchOutcome<()> {
        let offer = offer.unwrap_or_else(null_offer);
        let resolved = deadline.resolve();
        let mut g = self.state.lock();

        if matches!(g.retirement, RetireState::Retired) {
            return MatchOutcome::Done(Err(ChannelError::Retired));
        }

        let mut value = Some(value);

        loop {
            let Some(reader_offer) = g.readers.front().map(|r| r.offer.clone()) else {
                break;
            };
            let r_ok = reader_offer.offer();
            let w_ok = offer.offer();
            match (r_ok, w_ok) {
                (true, true) => {
                    reader_offer.commit();
                    offer.commit();
                    let reader = g.readers.pop_front().unwrap();
                    reader.completion.resolve(Ok(value.take().unwrap()));
                    g.last_write_tick += 1;
                    g.last_read_tick += 1;
                    decrement_retiring(&mut g);
                    trace!(channel = ?self.name, "write matched a waiting reader");
                    return MatchOutcome::Done(Ok(()));
                }
                (true, false) => {
                    reader_offer.withdraw();
                    trace!(channel = ?self.name, "write vetoed the match it was offered");
                    return MatchOutcome::Done(Err(ChannelError::Cancelled));
                }
                (false, w_ok) => {
                    if w_ok {
                        offer.withdraw();
                    }
                    let reader = g.readers.pop_front().unwrap();
                    reader.completion.resolve(Err(ChannelError::Cancelled));
                    continue;
                }
            }
        }

        // No reader is waiting. Try to buffer instead.
        if matches!(g.retirement, RetireState::Active) && g.writers.len() < self.buffer {
            if offer.offer() {
                offer.commit();
                g.writers.push_back(WriterSlot::Buffered(value.take().unwrap()));
                g.last_write_tick += 1;
                return MatchOutcome::Done(Ok(()));
            }
            return MatchOutcome::Done(Err(ChannelError::Cancelled));
        }

        if resolved.is_immediate() {
            return MatchOutcome::Done(Err(ChannelError::Timeout));
        }

        let blocked_count = g.writers.len().saturating_sub(self.buffer);
        if let Some(max) = self.max_pending_writers
            && blocked_count >= max
        {
            match self.writer_overflow {
                OverflowPolicy::Reject | OverflowPolicy::BlockSender | OverflowPolicy::BlockReceiver => {
                    warn!(channel = ?self.name, "writer queue overflow, rejecting");
                    return MatchOutcome::Done(Err(ChannelError::Overflow));
                }
                OverflowPolicy::DropNewest => {
                    return MatchOutcome::Done(Err(ChannelError::Cancelled));
                }
                OverflowPolicy::DropOldest => {
                    if let Some(WriterSlot::Blocked { completion, .. }) = g.writers.remove(self.buffer) {
                        completion.resolve(Err(ChannelError::Cancelled));
                    }
                }
                OverflowPolicy::DropRandom => {
                    let victim = self.buffer + rand::thread_rng().gen_range(0..blocked_count);
                    if let Some(WriterSlot::Blocked { completion, .. }) = g.writers.remove(victim) {
                        completion.resolve(Err(ChannelError::Cancelled));
                    }
                }
            }
        }

        let completion = Completion::new();
        g.writers.push_back(WriterSlot::Blocked {
            offer,
            completion: completion.clone(),
            deadline: resolved,
            value: value.take().unwrap(),
        });
        if let Some(instant) = resolved.instant() {
            self.register_deadline(instant);
        }
        MatchOutcome::Pending(completion.future())
    }

    pub(crate) fn read(&self, offer: Option<Offer>, deadline: Deadline) -> MatchOutcome<T> {
        let offer = offer.unwrap_or_else(null_offer);
        let resolved = deadline.resolve();
        let mut g = self.state.lock();

        if matches!(g.retirement, RetireState::Retired) {
            return MatchOutcome::Done(Err(ChannelError::Retired));
        }

        loop {
            enum Front {
                None,
                Buffered,
                Blocked(Offer),
            }
            let front = match g.writers.front() {
                None => Front::None,
                Some(WriterSlot::Buffered(_)) => Front::Buffered,
                Some(WriterSlot::Blocked { offer, .. }) => Front::Blocked(offer.clone()),
            };

            match front {
                Front::None => break,
                Front::Buffered => {
                    if offer.offer() {
                        offer.commit();
                        let Some(WriterSlot::Buffered(value)) = g.writers.pop_front() else {
                            unreachable!("front was just matched as Buffered")
                        };
                        g.last_read_tick += 1;
                        if promote_into_buffer(&mut g.writers, self.buffer) {
                            g.last_write_tick += 1;
                        }
                        decrement_retiring(&mut g);
                        trace!(channel = ?self.name, "read consumed a buffered value");
                        return MatchOutcome::Done(Ok(value));
                    }
                    return MatchOutcome::Done(Err(ChannelError::Cancelled));
                }
                Front::Blocked(writer_offer) => {
                    let w_ok = writer_offer.offer();
                    let r_ok = offer.offer();
                    match (w_ok, r_ok) {
                        (true, true) => {
                            writer_offer.commit();
                            offer.commit();
                            let Some(WriterSlot::Blocked { completion, value, .. }) = g.writers.pop_front() else {
                                unreachable!("front was just matched as Blocked")
                            };
                            completion.resolve(Ok(()));
                            g.last_read_tick += 1;
                            g.last_write_tick += 1;
                            if promote_into_buffer(&mut g.writers, self.buffer) {
                                g.last_write_tick += 1;
                            }
                            decrement_retiring(&mut g);
                            trace!(channel = ?self.name, "read matched a blocked writer");
                            return MatchOutcome::Done(Ok(value));
                        }
                        (true, false) => {
                            writer_offer.withdraw();
                            return MatchOutcome::Done(Err(ChannelError::Cancelled));
                        }
                        (false, r_ok) => {
                            if r_ok {
                                offer.withdraw();
                            }
                            let Some(WriterSlot::Blocked { completion, .. }) = g.writers.pop_front() else {
                                unreachable!("front was just matched as Blocked")
                            };
                            completion.resolve(Err(ChannelError::Cancelled));
                            continue;
                        }
                    }
                }
            }
        }

        // No writer is waiting.
        if let RetireState::Retiring(k) = &mut g.retirement {
            *k -= 1;
            if *k == 0 {
                finalize_retired(&mut g);
            }
            return MatchOutcome::Done(Err(ChannelError::Retired));
        }

        if resolved.is_immediate() {
            return MatchOutcome::Done(Err(ChannelError::Timeout));
        }

        if let Some(max) = self.max_pending_readers
            && g.readers.len() >= max
        {
            match self.reader_overflow {
                OverflowPolicy::Reject | OverflowPolicy::BlockSender | OverflowPolicy::BlockReceiver => {
                    warn!(channel = ?self.name, "reader queue overflow, rejecting");
                    return MatchOutcome::Done(Err(ChannelError::Overflow));
                }
                OverflowPolicy::DropNewest => {
                    return MatchOutcome::Done(Err(ChannelError::Cancelled));
                }
                OverflowPolicy::DropOldest => {
                    if let Some(evicted) = g.readers.pop_front() {
                        evicted.completion.resolve(Err(ChannelError::Cancelled));
                    }
                }
                OverflowPolicy::DropRandom => {
                    let victim = rand::thread_rng().gen_range(0..g.readers.len());
                    let evicted = g.readers.remove(victim).unwrap();
                    evicted.completion.resolve(Err(ChannelError::Cancelled));
                }
            }
        }

        let completion = Completion::new();
        g.readers.push_back(ReaderEntry {
            offer,
            completion: completion.clone(),
            deadline: resolved,
        });
        if let Some(instant) = resolved.instant() {
            self.register_deadline(instant);
        }
        MatchOutcome::Pending(completion.future())
    }

    pub(crate) fn retire(&self, immediate: bool) {
        let mut g = self.state.lock();
        if matches!(g.retirement, RetireState::Retired) {
            return;
        }
        if immediate {
            debug!(channel = ?self.name, "retiring immediately");
            finalize_retired(&mut g);
            return;
        }
        if g.writers.is_empty() {
            // Nothing buffered can ever be observed; the single grace unit
            // the formula below would grant has nothing left to drain.
            debug!(channel = ?self.name, "retiring, no buffered backlog to drain");
            finalize_retired(&mut g);
        } else {
            let k = g.writers.len().min(self.buffer) + 1;
            debug!(channel = ?self.name, k, "retiring, draining buffered backlog");
            g.retirement = RetireState::Retiring(k);
        }
    }

    pub(crate) fn is_retired(&self) -> bool {
        matches!(self.state.lock().retirement, RetireState::Retired)
    }

    pub(crate) fn last_read_tick(&self) -> u64 {
        self.state.lock().last_read_tick
    }

    pub(crate) fn last_write_tick(&self) -> u64 {
        self.state.lock().last_write_tick
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.state
            .lock()
            .writers
            .iter()
            .filter(|w| matches!(w, WriterSlot::Buffered(_)))
            .count()
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
        g.writers.retain(|w| match w {
            WriterSlot::Buffered(_) => true,
            WriterSlot::Blocked { completion, deadline, .. } => {
                if deadline.has_elapsed(now) {
                    completion.resolve(Err(ChannelError::Timeout));
                    false
                } else {
                    if let Some(inst) = deadline.instant() {
                        next = Some(next.map_or(inst, |n| n.min(inst)));
                    }
                    true
                }
            }
        });
        drop(g);
        if let Some(instant) = next {
            self.register_deadline(instant);
        }
    }
}

impl<T: Send + 'static> ExpirableChannel for ChannelInner<T> {
    fn expire_due(&self, now: Instant) {
        self.scan_expired(now);
    }
}

/// Resolves the entry that just slid into the buffer window (index `buffer -
/// 1`) after a pop freed a slot, trying the next one in line if it vetoes.
/// Returns whether a blocked writer was actually promoted (and therefore
/// just had its write succeed), so the caller can bump `last_write_tick`.
fn promote_into_buffer<T>(writers: &mut VecDeque<WriterSlot<T>>, buffer: usize) -> bool {
    if buffer == 0 {
        return false;
    }
    let idx = buffer - 1;
    loop {
        if idx >= writers.len() || !matches!(writers[idx], WriterSlot::Blocked { .. }) {
            return false;
        }
        let Some(WriterSlot::Blocked { offer, completion, value, .. }) = writers.remove(idx) else {
            unreachable!("just checked this index holds a Blocked slot")
        };
        if offer.offer() {
            offer.commit();
            completion.resolve(Ok(()));
            writers.insert(idx, WriterSlot::Buffered(value));
            return true;
        }
        completion.resolve(Err(ChannelError::Cancelled));
        // loop again: the next entry just slid into `idx`
    }
}

fn decrement_retiring<T>(g: &mut State<T>) {
    if let RetireState::Retiring(k) = &mut g.retirement {
        *k -= 1;
        if *k == 0 {
            finalize_retired(g);
        }
    }
}

fn finalize_retired<T>(g: &mut State<T>) {
    g.retirement = RetireState::Retired;
    for reader in g.readers.drain(..) {
        reader.completion.resolve(Err(ChannelError::Retired));
    }
    for writer in g.writers.drain(..) {
        if let WriterSlot::Blocked { completion, .. } = writer {
            completion.resolve(Err(ChannelError::Retired));
        }
        // Buffered values are simply dropped: the channel died before any
        // reader arrived to observe them.
    }
}
