//! A bounded MPSC channel that drops the *oldest* queued item on overflow
//! instead of blocking or rejecting the newest one.
//!
//! `tokio::sync::mpsc` can reject a full channel (`try_send`) but has no way
//! for the producer to evict an already-queued item, so the receiver's
//! documented back-pressure policy — drop the oldest Sample and increment a
//! counter rather than stalling, since back-pressuring the serial link
//! overruns the radio module's hardware buffer — needs its own small
//! primitive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

pub struct RingSender<T> {
    shared: Arc<Shared<T>>,
}

pub struct RingReceiver<T> {
    shared: Arc<Shared<T>>,
}

pub fn channel<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        capacity,
        dropped: AtomicU64::new(0),
    });
    (
        RingSender {
            shared: shared.clone(),
        },
        RingReceiver { shared },
    )
}

impl<T> RingSender<T> {
    /// Pushes `item`. Returns the evicted item if the queue was already at
    /// capacity.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut q = self.shared.queue.lock().expect("ring channel poisoned");
            let evicted = if q.len() >= self.shared.capacity {
                q.pop_front()
            } else {
                None
            };
            q.push_back(item);
            evicted
        };
        if evicted.is_some() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.notify.notify_one();
        evicted
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Clone for RingSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> RingReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut q = self.shared.queue.lock().expect("ring channel poisoned");
                if let Some(item) = q.pop_front() {
                    return Some(item);
                }
            }
            if Arc::strong_count(&self.shared) == 1 {
                // No sender remains and the queue is empty.
                return None;
            }
            self.shared.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drops_oldest_on_overflow() {
        let (tx, mut rx) = channel::<u32>(2);
        tx.push(1);
        tx.push(2);
        let evicted = tx.push(3);
        assert_eq!(evicted, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(tx.dropped_count(), 1);
    }
}
