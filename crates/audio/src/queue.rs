//! Bounded chunk queue between the capture thread and the forwarder task
//!
//! Capacity is roughly one second of audio. When the consumer stalls the
//! oldest chunks are discarded first so whatever the recognizer eventually
//! receives stays closest to live speech; drops advance a counter and are
//! logged, never surfaced as errors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use vhisper_core::AudioChunk;

/// Bounded drop-oldest queue of audio chunks.
pub struct ChunkQueue {
    inner: Mutex<VecDeque<AudioChunk>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl ChunkQueue {
    /// Create a queue holding at most `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Enqueue a chunk, discarding the oldest one on overflow.
    ///
    /// Called from the capture thread; never blocks.
    pub fn push(&self, chunk: AudioChunk) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped = total, "audio queue full, dropping oldest chunk");
            }
            queue.push_back(chunk);
        }
        self.notify.notify_one();
    }

    /// Await the next chunk. Returns `None` once the queue is closed and
    /// drained, which ends the forwarder's loop.
    pub async fn recv(&self) -> Option<AudioChunk> {
        loop {
            if let Some(chunk) = self.inner.lock().pop_front() {
                return Some(chunk);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let notified = self.notify.notified();
            // Re-check after registering interest so a push between the pop
            // and the await cannot be missed.
            if let Some(chunk) = self.inner.lock().pop_front() {
                return Some(chunk);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking pop.
    pub fn try_recv(&self) -> Option<AudioChunk> {
        self.inner.lock().pop_front()
    }

    /// Close the queue; pending chunks stay readable, waiters wake up.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Drop everything buffered.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Chunks discarded due to overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Buffered chunk count
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: u64) -> AudioChunk {
        AudioChunk::new(vec![0u8; 4], offset)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = ChunkQueue::new(4);
        queue.push(chunk(0));
        queue.push(chunk(2));
        assert_eq!(queue.recv().await.unwrap().offset_samples, 0);
        assert_eq!(queue.recv().await.unwrap().offset_samples, 2);
    }

    #[tokio::test]
    async fn test_drop_oldest_on_overflow() {
        let queue = ChunkQueue::new(2);
        queue.push(chunk(0));
        queue.push(chunk(1));
        queue.push(chunk(2));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.recv().await.unwrap().offset_samples, 1);
        assert_eq!(queue.recv().await.unwrap().offset_samples, 2);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = ChunkQueue::new(2);
        queue.push(chunk(7));
        queue.close();
        assert_eq!(queue.recv().await.unwrap().offset_samples, 7);
        assert!(queue.recv().await.is_none());
        // Pushes after close are ignored
        queue.push(chunk(8));
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = std::sync::Arc::new(ChunkQueue::new(2));
        let rx = queue.clone();
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        queue.push(chunk(3));
        let received = handle.await.unwrap().unwrap();
        assert_eq!(received.offset_samples, 3);
    }
}
