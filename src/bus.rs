use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;

use crate::chunk::Chunk;
use crate::config::BackpressurePolicy;

#[derive(Debug, Error)]
#[error("capture bus is closed")]
pub struct BusClosed(pub Chunk);

struct BusState {
    queue: VecDeque<Chunk>,
    closed: bool,
}

/// Bounded multi-producer, single-consumer queue between the port readers
/// and the classifier.
///
/// Pending chunks are kept sorted by their read timestamp; chunks with equal
/// timestamps keep the order in which `push` completed.
pub struct CaptureBus {
    state: Mutex<BusState>,
    capacity: usize,
    policy: BackpressurePolicy,
    readable: Notify,
    writable: Notify,
    accepted: AtomicU64,
    overruns: AtomicU64,
}

impl CaptureBus {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            state: Mutex::new(BusState {
                queue: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            capacity: capacity.max(1),
            policy,
            readable: Notify::new(),
            writable: Notify::new(),
            accepted: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a chunk. Under [`BackpressurePolicy::Block`] this waits for
    /// space; under [`BackpressurePolicy::DropOldest`] it never waits.
    pub async fn push(&self, chunk: Chunk) -> Result<(), BusClosed> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(BusClosed(chunk));
                }
                if state.queue.len() >= self.capacity
                    && self.policy == BackpressurePolicy::DropOldest
                {
                    state.queue.pop_front();
                    self.overruns.fetch_add(1, Ordering::Relaxed);
                }
                if state.queue.len() < self.capacity {
                    insert_ordered(&mut state.queue, chunk);
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    drop(state);
                    self.readable.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Waits for the next chunk. Returns `None` once the bus is closed and drained.
    pub async fn recv(&self) -> Option<Chunk> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(next) = self.try_recv() {
                return Some(next);
            }
            if self.lock().closed {
                return None;
            }

            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<Chunk> {
        let next = self.lock().queue.pop_front();
        if next.is_some() {
            self.writable.notify_waiters();
        }
        next
    }

    /// Stops accepting chunks. Chunks already queued stay available to `recv`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunks discarded because the backlog was full.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

fn insert_ordered(queue: &mut VecDeque<Chunk>, chunk: Chunk) {
    let at = queue
        .iter()
        .rposition(|queued| queued.timestamp() <= chunk.timestamp())
        .map_or(0, |idx| idx + 1);
    queue.insert(at, chunk);
}
