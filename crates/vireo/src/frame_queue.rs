//! Bounded frame queue between a decode worker and its consumer.
//!
//! The producer (decode worker) gates itself on [`FrameQueue::wait_for_space`]
//! before reading the next packet and uses [`FrameQueue::try_push`] at push
//! time, dropping the frame if the queue filled in between. The consumer
//! (audio producer loop or video presenter) pops without blocking.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::frame::DecodedFrame;

/// A thread-safe bounded FIFO of decoded frames.
pub struct FrameQueue {
    frames: Mutex<VecDeque<Arc<DecodedFrame>>>,
    capacity: usize,
    /// Signaled when space frees up, the queue drains, or source state changes
    space_available: Condvar,
}

impl FrameQueue {
    /// Creates a queue holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            space_available: Condvar::new(),
        }
    }

    /// Pushes a frame without blocking. Returns false when the queue is full.
    pub fn try_push(&self, frame: Arc<DecodedFrame>) -> bool {
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            return false;
        }
        frames.push_back(frame);
        true
    }

    /// Takes the oldest frame, or `None` when the queue is empty.
    pub fn pop(&self) -> Option<Arc<DecodedFrame>> {
        let mut frames = self.frames.lock();
        let frame = frames.pop_front();
        if frame.is_some() {
            self.space_available.notify_all();
        }
        frame
    }

    /// PTS of the oldest queued frame without removing it.
    pub fn front_pts(&self) -> Option<i64> {
        let frames = self.frames.lock();
        frames.front().map(|f| f.pts_us)
    }

    /// Blocks while the queue is full, until space frees up or `cancel`
    /// returns true. The predicate is re-evaluated on every wakeup.
    pub fn wait_for_space<F: Fn() -> bool>(&self, cancel: F) {
        let mut frames = self.frames.lock();
        while frames.len() >= self.capacity && !cancel() {
            self.space_available.wait(&mut frames);
        }
    }

    /// Blocks until the queue is empty or `cancel` returns true. Returns true
    /// when the queue drained.
    pub fn wait_for_drain<F: Fn() -> bool>(&self, cancel: F) -> bool {
        let mut frames = self.frames.lock();
        while !frames.is_empty() && !cancel() {
            self.space_available.wait(&mut frames);
        }
        frames.is_empty()
    }

    /// Wakes producers blocked in [`wait_for_space`]/[`wait_for_drain`] so
    /// they can re-check source state.
    pub fn notify_waiters(&self) {
        self.space_available.notify_all();
    }

    /// Drops all queued frames and wakes blocked producers. Always safe.
    pub fn clear(&self) {
        let dropped = {
            let mut frames = self.frames.lock();
            let count = frames.len();
            frames.clear();
            count
        };
        if dropped > 0 {
            tracing::debug!("frame queue cleared, dropped {} frames", dropped);
        }
        self.space_available.notify_all();
    }

    /// Number of frames currently queued.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// True when no frames are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Maximum number of frames the queue holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FramePayload, VideoPayload};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn frame(pts_us: i64) -> Arc<DecodedFrame> {
        Arc::new(DecodedFrame {
            payload: FramePayload::Video(Arc::new(VideoPayload {
                format: crate::frame::PixelFormat::Yuv420p,
                width: 2,
                height: 2,
                planes: Vec::new(),
            })),
            pts_us,
            duration_us: 40_000,
        })
    }

    #[test]
    fn bounded_push_pop_fifo() {
        let queue = FrameQueue::new(3);
        assert!(queue.try_push(frame(0)));
        assert!(queue.try_push(frame(1)));
        assert!(queue.try_push(frame(2)));
        assert!(queue.is_full());
        assert!(!queue.try_push(frame(3)), "push past capacity must fail");
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop().unwrap().pts_us, 0);
        assert_eq!(queue.pop().unwrap().pts_us, 1);
        assert!(queue.try_push(frame(3)));
        assert_eq!(queue.pop().unwrap().pts_us, 2);
        assert_eq!(queue.pop().unwrap().pts_us, 3);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn front_pts_peeks_without_removing() {
        let queue = FrameQueue::new(2);
        assert_eq!(queue.front_pts(), None);
        queue.try_push(frame(7));
        assert_eq!(queue.front_pts(), Some(7));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn clear_wakes_blocked_producer() {
        let queue = Arc::new(FrameQueue::new(1));
        queue.try_push(frame(0));

        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                queue.wait_for_space(|| false);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        queue.clear();
        waiter.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn wait_for_space_observes_cancellation() {
        let queue = Arc::new(FrameQueue::new(1));
        queue.try_push(frame(0));
        let cancelled = Arc::new(AtomicBool::new(false));

        let waiter = {
            let queue = Arc::clone(&queue);
            let cancelled = Arc::clone(&cancelled);
            std::thread::spawn(move || {
                queue.wait_for_space(|| cancelled.load(Ordering::Acquire));
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        cancelled.store(true, Ordering::Release);
        queue.notify_waiters();
        waiter.join().unwrap();
        assert!(queue.is_full(), "cancellation must not consume frames");
    }

    #[test]
    fn wait_for_drain_returns_once_consumer_empties() {
        let queue = Arc::new(FrameQueue::new(4));
        queue.try_push(frame(0));
        queue.try_push(frame(1));

        let drainer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.wait_for_drain(|| false))
        };

        std::thread::sleep(Duration::from_millis(20));
        while queue.pop().is_some() {}
        assert!(drainer.join().unwrap());
    }
}
