//! Lock-free PCM queue feeding the playback lane
//!
//! Single producer (the engine) and single consumer (the lane). Capacity is
//! a byte budget so a partial accept tells the producer exactly how much
//! audio fits.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounded queue of PCM chunks
pub struct PcmQueue {
    queue: ArrayQueue<Bytes>,
    queued_bytes: AtomicUsize,
    capacity_bytes: usize,
    /// Accepted lengths are rounded down to whole frames
    frame_bytes: usize,
    overflow_count: AtomicUsize,
}

impl PcmQueue {
    /// Create a queue holding at most `capacity_bytes` in up to `slots` chunks
    pub fn new(capacity_bytes: usize, frame_bytes: usize, slots: usize) -> Self {
        Self {
            queue: ArrayQueue::new(slots.max(1)),
            queued_bytes: AtomicUsize::new(0),
            capacity_bytes,
            frame_bytes: frame_bytes.max(1),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Enqueue as much of `pcm` as fits. Returns bytes accepted.
    pub fn push(&self, pcm: &[u8]) -> usize {
        if pcm.is_empty() {
            return 0;
        }

        let free = self
            .capacity_bytes
            .saturating_sub(self.queued_bytes.load(Ordering::Acquire));
        let mut accept = free.min(pcm.len());
        accept -= accept % self.frame_bytes;

        if accept == 0 {
            // Less than a frame offered is not a full queue
            if pcm.len() >= self.frame_bytes {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
            }
            return 0;
        }

        // Count the bytes before the consumer can pop and subtract them
        self.queued_bytes.fetch_add(accept, Ordering::AcqRel);
        match self.queue.push(Bytes::copy_from_slice(&pcm[..accept])) {
            Ok(()) => accept,
            Err(_) => {
                self.queued_bytes.fetch_sub(accept, Ordering::AcqRel);
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Pop the oldest chunk
    pub fn pop(&self) -> Option<Bytes> {
        let chunk = self.queue.pop()?;
        self.queued_bytes.fetch_sub(chunk.len(), Ordering::AcqRel);
        Some(chunk)
    }

    /// Drop everything queued. Returns bytes discarded.
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while let Some(chunk) = self.pop() {
            dropped += chunk.len();
        }
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Bytes currently queued
    pub fn len_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Number of pushes that were refused outright
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        self.len_bytes() as f32 / self.capacity_bytes as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_in_order() {
        let queue = PcmQueue::new(64, 4, 8);

        assert_eq!(queue.push(&[1; 8]), 8);
        assert_eq!(queue.push(&[2; 8]), 8);
        assert_eq!(queue.len_bytes(), 16);

        assert_eq!(queue.pop().unwrap().as_ref(), &[1; 8]);
        assert_eq!(queue.pop().unwrap().as_ref(), &[2; 8]);
        assert!(queue.is_empty());
        assert_eq!(queue.len_bytes(), 0);
    }

    #[test]
    fn test_partial_accept_is_frame_aligned() {
        let queue = PcmQueue::new(10, 4, 8);

        // 10 bytes free but only two whole 4-byte frames fit
        assert_eq!(queue.push(&[0; 16]), 8);
        assert_eq!(queue.push(&[0; 4]), 0);
        assert_eq!(queue.overflow_count(), 1);

        queue.pop();
        assert_eq!(queue.push(&[0; 4]), 4);
    }

    #[test]
    fn test_slot_exhaustion_refuses() {
        let queue = PcmQueue::new(1024, 2, 2);
        assert_eq!(queue.push(&[0; 2]), 2);
        assert_eq!(queue.push(&[0; 2]), 2);
        assert_eq!(queue.push(&[0; 2]), 0);
        assert_eq!(queue.len_bytes(), 4);
    }

    #[test]
    fn test_sub_frame_push_is_not_an_overflow() {
        let queue = PcmQueue::new(64, 4, 8);
        assert_eq!(queue.push(&[0; 3]), 0);
        assert_eq!(queue.overflow_count(), 0);
        assert_eq!(queue.len_bytes(), 0);
    }

    #[test]
    fn test_byte_count_never_wraps_under_concurrent_pop() {
        let queue = std::sync::Arc::new(PcmQueue::new(4096, 4, 64));
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                let mut popped = 0;
                while popped < 2000 * 4 {
                    assert!(queue.len_bytes() <= queue.capacity_bytes());
                    if let Some(chunk) = queue.pop() {
                        popped += chunk.len();
                    }
                }
            })
        };

        let mut pushed = 0;
        while pushed < 2000 {
            if queue.push(&[0; 4]) == 4 {
                pushed += 1;
            }
            assert!(queue.len_bytes() <= queue.capacity_bytes());
        }
        consumer.join().unwrap();
        assert_eq!(queue.len_bytes(), 0);
    }

    #[test]
    fn test_clear() {
        let queue = PcmQueue::new(100, 2, 8);
        queue.push(&[0; 20]);
        queue.push(&[0; 30]);
        assert_eq!(queue.clear(), 50);
        assert_eq!(queue.fill_level(), 0.0);
    }
}
