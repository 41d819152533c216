//! Bounded single-producer/single-consumer queues shared between pipeline
//! stages. Overflow drops the newest item and increments a monotone
//! counter rather than blocking the producer (spec.md S4.3/S4.5/S4.8).

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};

pub const INGEST_QUEUE_CAPACITY: usize = 10_000;
pub const DECODE_QUEUE_CAPACITY: usize = 5_000;
pub const PERSIST_QUEUE_CAPACITY: usize = 1_000;

/// A bounded queue with exactly one producer and one consumer. `enqueue`
/// never blocks: a full queue drops the item and counts the drop.
/// `dequeue` never blocks: an empty queue returns `None`.
pub struct BoundedQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity);
        BoundedQueue {
            sender,
            receiver,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of buffered items (approximate under concurrency).
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Attempts to enqueue `item`. Returns `true` if accepted, `false` if
    /// the queue was full (the item is discarded) or the consumer side has
    /// been dropped.
    pub fn enqueue(&self, item: T) -> bool {
        match self.sender.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(capacity = self.capacity, "queue overflow, dropping item");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Non-blocking dequeue of a single item.
    pub fn dequeue(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Drains up to `max` items without blocking, preserving order. Used
    /// by the Batch Writer to pull a flush-sized batch off the Persist
    /// Queue (spec.md S4.8/S4.9).
    pub fn drain_up_to(&self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max.min(self.len().max(1)));
        while out.len() < max {
            match self.receiver.try_recv() {
                Ok(item) => out.push(item),
                Err(_) => break,
            }
        }
        out
    }
}
