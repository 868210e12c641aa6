//! The display surface consumed by the video presenter.
//!
//! The presenter treats the renderer as opaque: it enqueues pixel payloads
//! without blocking and polls the window handle for a close request. The
//! in-tree [`HeadlessSink`] implements the contract with a bounded
//! drop-oldest queue; a GPU-backed implementation plugs in through the same
//! trait.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PlayerError;
use crate::frame::VideoPayload;

/// Frames buffered by a sink before the oldest is dropped.
pub const SINK_QUEUE_CAPACITY: usize = 5;

/// Cloneable handle to the presentation window.
///
/// Carries the close request the windowing layer posts and the presenter
/// polls every loop iteration.
#[derive(Clone, Default)]
pub struct WindowHandle {
    close_requested: Arc<AtomicBool>,
}

impl WindowHandle {
    /// Creates a handle with no close request pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a close has been requested.
    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    /// Posts a close request. Idempotent.
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
    }
}

/// Where decoded video frames go for display.
pub trait FrameSink: Send + Sync {
    /// Prepares the sink for frames of the given dimensions.
    fn start(&self, width: u32, height: u32) -> Result<(), PlayerError>;

    /// Shuts the sink down.
    fn stop(&self);

    /// Hands a frame over without blocking; the sink drops its oldest
    /// buffered frame when full.
    fn enqueue_frame(&self, frame: Arc<VideoPayload>);

    /// Discards all buffered frames.
    fn clear_frames(&self);

    /// True while the sink accepts frames.
    fn is_running(&self) -> bool;

    /// Handle to the presentation window.
    fn window(&self) -> WindowHandle;
}

/// A sink with no display: frames land in a bounded queue and can be taken
/// by whoever drives it (tests, the CLI's progress loop).
#[derive(Default)]
pub struct HeadlessSink {
    frames: Mutex<VecDeque<Arc<VideoPayload>>>,
    running: AtomicBool,
    dimensions: Mutex<Option<(u32, u32)>>,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    window: WindowHandle,
}

impl HeadlessSink {
    /// Creates a stopped sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the oldest buffered frame.
    pub fn take_frame(&self) -> Option<Arc<VideoPayload>> {
        self.frames.lock().pop_front()
    }

    /// Dimensions passed to [`FrameSink::start`].
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        *self.dimensions.lock()
    }

    /// Total frames ever enqueued.
    pub fn frames_enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Frames discarded because the queue was full.
    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSink for HeadlessSink {
    fn start(&self, width: u32, height: u32) -> Result<(), PlayerError> {
        if width == 0 || height == 0 {
            return Err(PlayerError::InvalidArgument(format!(
                "sink dimensions {width}x{height}"
            )));
        }
        *self.dimensions.lock() = Some((width, height));
        self.running.store(true, Ordering::Release);
        tracing::info!("headless sink started at {width}x{height}");
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn enqueue_frame(&self, frame: Arc<VideoPayload>) {
        let mut frames = self.frames.lock();
        if frames.len() >= SINK_QUEUE_CAPACITY {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    fn clear_frames(&self) {
        self.frames.lock().clear();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn window(&self) -> WindowHandle {
        self.window.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn payload(width: u32) -> Arc<VideoPayload> {
        Arc::new(VideoPayload {
            format: PixelFormat::Yuv420p,
            width,
            height: 2,
            planes: Vec::new(),
        })
    }

    #[test]
    fn start_validates_dimensions() {
        let sink = HeadlessSink::new();
        assert!(sink.start(0, 10).is_err());
        assert!(!sink.is_running());
        sink.start(320, 240).unwrap();
        assert!(sink.is_running());
        assert_eq!(sink.dimensions(), Some((320, 240)));
    }

    #[test]
    fn enqueue_drops_oldest_when_full() {
        let sink = HeadlessSink::new();
        sink.start(4, 4).unwrap();
        for i in 0..(SINK_QUEUE_CAPACITY as u32 + 2) {
            sink.enqueue_frame(payload(i + 1));
        }
        assert_eq!(sink.frames_dropped(), 2);
        // Oldest two were discarded; the head is now the third frame.
        assert_eq!(sink.take_frame().unwrap().width, 3);
    }

    #[test]
    fn clear_discards_buffered_frames() {
        let sink = HeadlessSink::new();
        sink.start(4, 4).unwrap();
        sink.enqueue_frame(payload(1));
        sink.clear_frames();
        assert!(sink.take_frame().is_none());
    }

    #[test]
    fn window_close_request_is_visible_through_clones() {
        let sink = HeadlessSink::new();
        let window = sink.window();
        assert!(!window.close_requested());
        sink.window().request_close();
        assert!(window.close_requested());
    }
}
