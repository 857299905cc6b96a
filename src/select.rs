//! Atomic selection across many channels: `read_from_any`/`write_to_any`
//! perform exactly one of a set of candidate operations, leaving every
//! other candidate with no observable side effect.
//!
//! The whole mechanism rests on one lock-free flag shared by every
//! candidate in a single selection call. [`SelectOffer::offer`] is a CAS on
//! that flag: the first channel to successfully match against it wins, and
//! every later attempt against the same flag (on any channel, synchronous
//! or queued) sees it already set and fails its own offer. Because
//! `offer`/`withdraw` never touch anything but this one atomic, a channel
//! can safely invoke them while holding its own lock without risking a
//! cross-channel deadlock.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crossbeam_utils::CachePadded;
use rand::seq::SliceRandom;

use crate::channel::{Channel, ReadFuture, WriteFuture};
use crate::deadline::Deadline;
use crate::error::{ChannelError, Result};
use crate::offer::{Offer, OfferHandle};

/// Which candidate a selection should favor when more than one could
/// proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Try candidates in the order given; the first that can proceed wins.
    First,
    /// Shuffle the candidate order once per call.
    Random,
    /// Rotate the starting index round-robin across calls, so no candidate
    /// is permanently favored by its position in the slice.
    Fair,
    /// Implementation-defined; currently the same as `First`.
    Any,
}

// Every `Priority::Fair` selection call across the process hits this one
// counter; cache-padding it keeps its cacheline from bouncing against
// whatever happens to sit next to it, the same reasoning the kernel's
// SPSC slots pad producer/consumer indices for.
static FAIR_CURSOR: CachePadded<AtomicUsize> = CachePadded::new(AtomicUsize::new(0));

impl Priority {
    fn order(self, len: usize) -> Vec<usize> {
        match self {
            Priority::First | Priority::Any => (0..len).collect(),
            Priority::Random => {
                let mut order: Vec<usize> = (0..len).collect();
                order.shuffle(&mut rand::thread_rng());
                order
            }
            Priority::Fair => {
                let start = FAIR_CURSOR.fetch_add(1, Ordering::Relaxed) % len.max(1);
                (0..len).map(|i| (start + i) % len).collect()
            }
        }
    }
}

/// The shared handle every candidate in one selection call offers through.
/// A CAS win is permanent: `commit` does nothing because the flag itself
/// already recorded the win, and a handle is never reused across calls.
struct SelectOffer {
    won: AtomicBool,
}

impl OfferHandle for SelectOffer {
    fn offer(&self) -> bool {
        self.won
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn withdraw(&self) {
        self.won.store(false, Ordering::Release);
    }

    fn commit(&self) {}
}

fn select_handle() -> Offer {
    Arc::new(SelectOffer { won: AtomicBool::new(false) })
}

/// Is this error a candidate's own terminal state (nothing to do with the
/// selection), as opposed to `Cancelled` which only happens once another
/// candidate has already won?
fn is_candidate_terminal(err: &ChannelError) -> bool {
    !matches!(err, ChannelError::Cancelled)
}

/// Polls a set of `(index, future)` pairs until one resolves to `Ok`, or all
/// of them are exhausted, without ever re-polling a future after it
/// resolves.
struct AnyOf<F> {
    pending: Vec<(usize, F)>,
}

impl<T, F: Future<Output = Result<T>> + Unpin> Future for AnyOf<F> {
    type Output = Result<(usize, T)>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut last_err = ChannelError::Timeout;
        let mut i = 0;
        while i < self.pending.len() {
            let (idx, fut) = &mut self.pending[i];
            match Pin::new(fut).poll(cx) {
                Poll::Ready(Ok(value)) => {
                    let idx = *idx;
                    return Poll::Ready(Ok((idx, value)));
                }
                Poll::Ready(Err(err)) => {
                    last_err = err;
                    self.pending.swap_remove(i);
                }
                Poll::Pending => i += 1,
            }
        }
        if self.pending.is_empty() {
            Poll::Ready(Err(last_err))
        } else {
            Poll::Pending
        }
    }
}

/// Attempts exactly one read across `channels`, per `priority`, completing
/// as soon as any candidate can proceed and leaving every other candidate
/// without a committed match. Returns the winning candidate's index and the
/// value it read.
pub async fn read_from_any<T: Send + 'static>(
    channels: &[&Channel<T>],
    priority: Priority,
    deadline: Deadline,
) -> Result<(usize, T)> {
    if channels.is_empty() {
        return Err(ChannelError::InvalidArgument("no channels given to select over".into()));
    }
    let handle = select_handle();
    let mut pending = Vec::with_capacity(channels.len());
    let mut last_err = ChannelError::Timeout;

    for idx in priority.order(channels.len()) {
        let mut fut: ReadFuture<T> = channels[idx].read(Some(handle.clone()), deadline);
        match fut.try_done() {
            Some(Ok(value)) => return Ok((idx, value)),
            Some(Err(err)) => {
                if is_candidate_terminal(&err) {
                    last_err = err;
                }
                continue;
            }
            None => pending.push((idx, fut)),
        }
    }

    if pending.is_empty() {
        return Err(last_err);
    }
    AnyOf { pending }.await
}

/// Attempts exactly one write of `value` (cloned per candidate, since at
/// most one clone is ever actually delivered) across `channels`. Returns the
/// winning candidate's index.
pub async fn write_to_any<T: Clone + Send + 'static>(
    channels: &[&Channel<T>],
    value: T,
    priority: Priority,
    deadline: Deadline,
) -> Result<usize> {
    if channels.is_empty() {
        return Err(ChannelError::InvalidArgument("no channels given to select over".into()));
    }
    let handle = select_handle();
    let mut pending = Vec::with_capacity(channels.len());
    let mut last_err = ChannelError::Timeout;

    for idx in priority.order(channels.len()) {
        let mut fut: WriteFuture = channels[idx].write(value.clone(), Some(handle.clone()), deadline);
        match fut.try_done() {
            Some(Ok(())) => return Ok(idx),
            Some(Err(err)) => {
                if is_candidate_terminal(&err) {
                    last_err = err;
                }
                continue;
            }
            None => pending.push((idx, fut)),
        }
    }

    if pending.is_empty() {
        return Err(last_err);
    }
    AnyOf { pending }.await.map(|(idx, ())| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;

    fn rendezvous<T: Send + 'static>() -> Channel<T> {
        Channel::new(ChannelConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn read_from_any_picks_the_only_ready_channel() {
        let a = rendezvous::<i32>();
        let b = Channel::<i32>::new(ChannelConfig::default().with_buffer(1)).unwrap();
        b.write(42, None, Deadline::Immediate).await.unwrap();

        let (idx, value) = read_from_any(&[&a, &b], Priority::First, Deadline::Immediate)
            .await
            .unwrap();
        assert_eq!(idx, 1);
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn read_from_any_with_no_ready_channel_times_out() {
        let a = rendezvous::<i32>();
        let b = rendezvous::<i32>();
        let result = read_from_any(&[&a, &b], Priority::First, Deadline::Immediate).await;
        assert_eq!(result, Err(ChannelError::Timeout));
    }

    #[tokio::test]
    async fn read_from_any_waits_for_a_later_write_on_either_channel() {
        let a = rendezvous::<i32>();
        let b = rendezvous::<i32>();
        let writer = {
            let b = b.clone();
            tokio::spawn(async move { b.write(7, None, Deadline::Infinite).await })
        };
        let (idx, value) = read_from_any(&[&a, &b], Priority::First, Deadline::Infinite)
            .await
            .unwrap();
        assert_eq!(idx, 1);
        assert_eq!(value, 7);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn write_to_any_delivers_to_exactly_one_waiting_reader() {
        let a = rendezvous::<i32>();
        let b = rendezvous::<i32>();
        let reader = {
            let b = b.clone();
            tokio::spawn(async move { b.read(None, Deadline::Infinite).await })
        };
        tokio::task::yield_now().await;
        let idx = write_to_any(&[&a, &b], 9, Priority::First, Deadline::Infinite).await.unwrap();
        assert_eq!(idx, 1);
        assert_eq!(reader.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn empty_candidate_list_is_an_invalid_argument() {
        let result = read_from_any::<i32>(&[], Priority::First, Deadline::Immediate).await;
        assert_eq!(result, Err(ChannelError::InvalidArgument("no channels given to select over".into())));
    }
}
