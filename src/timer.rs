//! Process-wide expiration manager: a min-heap of (deadline, channel) that
//! fires a single background worker at the earliest registered instant,
//! coalescing duplicate registrations per channel so a channel with many
//! pending entries only ever occupies one heap slot at a time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// A channel (or broadcast channel) that can have pending entries time out.
pub(crate) trait ExpirableChannel: Send + Sync {
    fn expire_due(&self, now: Instant);
}

struct HeapEntry {
    deadline: Instant,
    seq: u64,
    channel_id: usize,
    channel: Weak<dyn ExpirableChannel>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// A min-heap of upcoming deadlines plus a single background worker task
/// that sleeps until the earliest one and resolves whatever expired there.
pub(crate) struct ExpirationManager {
    heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
    scheduled: Mutex<HashMap<usize, Instant>>,
    notify: Notify,
    // Every channel registering a deadline bumps this; cache-padded since
    // it's touched far more often than the heap itself is resized.
    seq: CachePadded<AtomicU64>,
    worker_started: OnceLock<()>,
}

impl ExpirationManager {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            scheduled: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            seq: CachePadded::new(AtomicU64::new(0)),
            worker_started: OnceLock::new(),
        })
    }

    /// The process-wide singleton channels default to.
    pub(crate) fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ExpirationManager>> = OnceLock::new();
        GLOBAL.get_or_init(Self::new).clone()
    }

    /// Registers `deadline` for `channel_id`, coalescing with any earlier
    /// deadline already scheduled for the same channel. `channel` must be
    /// able to scan its own queues and resolve whatever has expired by the
    /// time the manager invokes it.
    pub(crate) fn register(self: &Arc<Self>, channel_id: usize, deadline: Instant, channel: Weak<dyn ExpirableChannel>) {
        {
            let mut scheduled = self.scheduled.lock();
            if let Some(existing) = scheduled.get(&channel_id)
                && *existing <= deadline
            {
                return;
            }
            scheduled.insert(channel_id, deadline);
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(Reverse(HeapEntry {
            deadline,
            seq,
            channel_id,
            channel,
        }));
        self.notify.notify_one();
        self.ensure_worker();
    }

    fn ensure_worker(self: &Arc<Self>) {
        if self.worker_started.set(()).is_ok() {
            let this = self.clone();
            tokio::spawn(async move { this.run().await });
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next_deadline = self.heap.lock().peek().map(|Reverse(e)| e.deadline);
            match next_deadline {
                None => {
                    self.notify.notified().await;
                }
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            self.fire_due().await;
                        }
                        _ = self.notify.notified() => {
                            // An earlier deadline may have just been registered; re-check.
                        }
                    }
                }
            }
        }
    }

    async fn fire_due(&self) {
        let now = Instant::now();
        loop {
            let entry = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(Reverse(e)) if e.deadline <= now => heap.pop().map(|Reverse(e)| e),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };
            self.scheduled.lock().remove(&entry.channel_id);
            if let Some(channel) = entry.channel.upgrade() {
                trace!(channel_id = entry.channel_id, "expiration manager firing deadline");
                channel.expire_due(now);
            }
        }
    }
}
