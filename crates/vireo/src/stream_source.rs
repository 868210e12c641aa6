//! Stream source: demuxer + decoder + decode worker + bounded frame queue.
//!
//! One source per elementary stream. The dedicated worker thread reads
//! packets, decodes them, stamps microsecond timestamps (synthesizing them
//! when the container has none) and pushes shareable frames into the queue.
//! Consumers pop without blocking; back pressure is a condition-variable wait
//! on the queue before each packet read.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::decoder::{self, MediaDecoder, RawFrame, VideoConverter};
use crate::demuxer::{ts_to_us, Demuxer};
use crate::error::PlayerError;
use crate::frame::{DecodedFrame, FramePayload, MediaKind, PixelFormat, SampleFormat};
use crate::frame_queue::FrameQueue;

/// Frame queue capacity for video sources.
pub const VIDEO_QUEUE_CAPACITY: usize = 30;
/// Frame queue capacity for audio sources.
pub const AUDIO_QUEUE_CAPACITY: usize = 50;

/// Frames at or after the target that must be queued before a seek settles.
const SEEK_SETTLE_FRAMES: usize = 5;

/// Poll interval while the worker is paused.
const PAUSE_POLL: Duration = Duration::from_millis(10);
/// Poll interval after a transient empty read.
const EMPTY_READ_POLL: Duration = Duration::from_millis(5);

/// Synthetic PTS step when a frame reports no duration either.
const FALLBACK_VIDEO_STEP_US: i64 = 1_000_000 / 30;
const FALLBACK_AUDIO_STEP_US: i64 = 1_000_000 / 50;

/// Worker state of a stream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SourceState {
    /// No worker running (initial, and after EOF drain or stop)
    Stopped = 0,
    /// Worker exists but idles
    Paused = 1,
    /// Worker decodes
    Running = 2,
}

impl SourceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SourceState::Paused,
            2 => SourceState::Running,
            _ => SourceState::Stopped,
        }
    }
}

/// Metadata of the opened stream.
#[derive(Debug, Clone, Copy)]
pub enum StreamInfo {
    /// Video stream properties
    Video {
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Pixel format frames will carry after any conversion
        pixel_format: PixelFormat,
        /// Frames per second, 0 when the container does not say
        frame_rate: f64,
    },
    /// Audio stream properties
    Audio {
        /// Sample rate in Hz
        sample_rate: u32,
        /// Channel count
        channels: u16,
        /// Decoder-native sample format
        sample_format: SampleFormat,
        /// Channel layout mask, 0 when the container does not say
        layout_bits: u64,
    },
}

struct SourceShared {
    kind: MediaKind,
    state: AtomicU8,
    eof: AtomicBool,
    queue: FrameQueue,
}

impl SourceShared {
    fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SourceState) {
        self.state.store(state as u8, Ordering::Release);
        self.queue.notify_waiters();
    }

    fn compare_exchange_state(&self, from: SourceState, to: SourceState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.queue.notify_waiters();
        }
        swapped
    }
}

/// Everything the worker mutates; also taken by `seek` so the two exclude
/// each other.
struct SourceInner {
    demuxer: Demuxer,
    decoder: MediaDecoder,
    converter: Option<VideoConverter>,
    synthetic_pts_us: i64,
    frame_rate: f64,
    sample_rate: u32,
}

/// A decodable elementary stream with its own worker thread.
pub struct StreamSource {
    info: StreamInfo,
    duration_us: i64,
    shared: Arc<SourceShared>,
    inner: Arc<Mutex<SourceInner>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource")
            .field("info", &self.info)
            .field("duration_us", &self.duration_us)
            .finish()
    }
}

impl StreamSource {
    /// Opens `path` for the first stream of `kind` and initializes its
    /// decoder. The worker does not start until [`start`](Self::start).
    pub fn open(path: &str, kind: MediaKind) -> Result<Self, PlayerError> {
        tracing::info!("opening {} stream from {path}", kind.name());

        let demuxer = Demuxer::open(path, kind)?;
        let decoder = MediaDecoder::open(kind, demuxer.codec_parameters()?)?;

        let (info, frame_rate, sample_rate) = match &decoder {
            MediaDecoder::Video(d) => {
                let frame_rate = demuxer.frame_rate();
                let pixel_format =
                    decoder::map_pixel_format(d.format()).unwrap_or(PixelFormat::Yuv420p);
                tracing::info!(
                    "video stream: {}x{} @ {:.3} fps",
                    d.width(),
                    d.height(),
                    frame_rate
                );
                (
                    StreamInfo::Video {
                        width: d.width(),
                        height: d.height(),
                        pixel_format,
                        frame_rate,
                    },
                    frame_rate,
                    0,
                )
            }
            MediaDecoder::Audio(d) => {
                let sample_format = decoder::map_sample_format(d.format()).ok_or_else(|| {
                    PlayerError::OpenFailed(format!("sample format {:?}", d.format()))
                })?;
                let layout_bits = d.channel_layout().bits();
                if d.rate() == 0 || d.channels() == 0 {
                    return Err(PlayerError::OpenFailed(
                        "audio stream reports no rate or channels".to_string(),
                    ));
                }
                tracing::info!(
                    "audio stream: {}Hz, {} channels, {:?}",
                    d.rate(),
                    d.channels(),
                    sample_format
                );
                (
                    StreamInfo::Audio {
                        sample_rate: d.rate(),
                        channels: d.channels(),
                        sample_format,
                        layout_bits,
                    },
                    0.0,
                    d.rate(),
                )
            }
        };

        let duration_us = demuxer.duration_us();
        let capacity = match kind {
            MediaKind::Video => VIDEO_QUEUE_CAPACITY,
            MediaKind::Audio => AUDIO_QUEUE_CAPACITY,
        };
        let converter = match kind {
            MediaKind::Video => Some(VideoConverter::new()),
            MediaKind::Audio => None,
        };

        Ok(Self {
            info,
            duration_us,
            shared: Arc::new(SourceShared {
                kind,
                state: AtomicU8::new(SourceState::Stopped as u8),
                eof: AtomicBool::new(false),
                queue: FrameQueue::new(capacity),
            }),
            inner: Arc::new(Mutex::new(SourceInner {
                demuxer,
                decoder,
                converter,
                synthetic_pts_us: 0,
                frame_rate,
                sample_rate,
            })),
            worker: Mutex::new(None),
        })
    }

    /// Starts the decode worker. From Paused this resumes instead.
    pub fn start(&self) {
        match self.shared.state() {
            SourceState::Running => {
                tracing::warn!("{} source is already running", self.kind().name());
            }
            SourceState::Paused => {
                self.resume();
            }
            SourceState::Stopped => {
                // Reap a worker that stopped on its own (EOF drain).
                if let Some(handle) = self.worker.lock().take() {
                    let _ = handle.join();
                }
                self.shared.queue.clear();
                self.shared.eof.store(false, Ordering::Release);
                self.shared.set_state(SourceState::Running);

                tracing::info!("starting {} decode thread", self.kind().name());
                let shared = Arc::clone(&self.shared);
                let inner = Arc::clone(&self.inner);
                *self.worker.lock() = Some(thread::spawn(move || decode_loop(shared, inner)));
            }
        }
    }

    /// Pauses the decode worker (observed within one poll interval).
    pub fn pause(&self) {
        if self
            .shared
            .compare_exchange_state(SourceState::Running, SourceState::Paused)
        {
            tracing::info!("{} decoding paused", self.kind().name());
        }
    }

    /// Resumes a paused decode worker.
    pub fn resume(&self) {
        if self
            .shared
            .compare_exchange_state(SourceState::Paused, SourceState::Running)
        {
            tracing::info!("{} decoding resumed", self.kind().name());
        }
    }

    /// Requests the worker to stop. Returns without joining; see
    /// [`close`](Self::close).
    pub fn stop(&self) {
        self.shared.set_state(SourceState::Stopped);
    }

    /// Stops and joins the worker and clears the queue. Idempotent.
    pub fn close(&self) {
        self.stop();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.shared.queue.clear();
        self.shared.eof.store(false, Ordering::Release);
        tracing::info!("{} stream source closed", self.kind().name());
    }

    /// Takes the next decoded frame, if one is queued.
    pub fn next_frame(&self) -> Option<Arc<DecodedFrame>> {
        self.shared.queue.pop()
    }

    /// Repositions the stream so decoding continues from `target_us`.
    ///
    /// Queues up to [`SEEK_SETTLE_FRAMES`] frames at or after the target
    /// before returning. Never changes the worker's running/paused state; the
    /// caller pauses around the call.
    pub fn seek(&self, target_us: i64) -> Result<(), PlayerError> {
        if target_us < 0 || target_us > self.duration_us {
            return Err(PlayerError::InvalidArgument(format!(
                "seek target {target_us}us outside [0, {}]",
                self.duration_us
            )));
        }
        tracing::info!("{} seek to {}us", self.kind().name(), target_us);

        let mut inner = self.inner.lock();
        inner.demuxer.seek(target_us)?;
        inner.decoder.flush();
        self.shared.queue.clear();
        self.shared.eof.store(false, Ordering::Release);
        inner.synthetic_pts_us = 0;

        // Decode forward, discarding frames before the target, until enough
        // frames at or after it are queued or the stream ends.
        let kind = self.shared.kind;
        let mut queued = 0usize;
        let mut packets = 0u64;
        while queued < SEEK_SETTLE_FRAMES {
            let Some(packet) = inner.demuxer.next_packet()? else {
                tracing::warn!("{} seek hit end of stream after {packets} packets", kind.name());
                break;
            };
            inner
                .decoder
                .submit_packet(Some(&packet))
                .map_err(|e| PlayerError::SeekFailed(e.to_string()))?;
            packets += 1;

            loop {
                let raw = match inner.decoder.receive_frame() {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("{} decode error during seek: {e}", kind.name());
                        break;
                    }
                };

                let time_base = inner.demuxer.time_base();
                let Some(pts) = raw.pts() else {
                    continue;
                };
                let pts_us = ts_to_us(pts, time_base);
                if pts_us < target_us {
                    continue;
                }

                let duration_us = frame_duration_us(&raw, &inner, time_base);
                match build_frame(&mut inner, &raw, pts_us, duration_us) {
                    Ok(frame) => {
                        if self.shared.queue.try_push(frame) {
                            queued += 1;
                        }
                    }
                    Err(e) => tracing::warn!("{} frame conversion failed: {e}", kind.name()),
                }
            }
        }

        tracing::debug!("{} seek settled with {queued} frames queued", kind.name());
        Ok(())
    }

    /// Current worker state.
    pub fn state(&self) -> SourceState {
        self.shared.state()
    }

    /// True once the demuxer hit end of file (frames may still be queued).
    pub fn is_eof(&self) -> bool {
        self.shared.eof.load(Ordering::Acquire)
    }

    /// Stream metadata captured at open.
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Media kind of this source.
    pub fn kind(&self) -> MediaKind {
        self.shared.kind
    }

    /// Container duration in microseconds (0 when unknown).
    pub fn duration_us(&self) -> i64 {
        self.duration_us
    }

    /// Video frame rate, 0 for audio sources or unknown rates.
    pub fn frame_rate(&self) -> f64 {
        match self.info {
            StreamInfo::Video { frame_rate, .. } => frame_rate,
            StreamInfo::Audio { .. } => 0.0,
        }
    }

    /// Number of frames currently queued.
    pub fn queued_frames(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Duration of `raw` in microseconds: the frame's own duration when present,
/// else `1/frame_rate` for video or `samples/rate` for audio.
fn frame_duration_us(raw: &RawFrame, inner: &SourceInner, time_base: (i32, i32)) -> i64 {
    match raw {
        RawFrame::Video(_) => {
            let own = raw.duration();
            if own > 0 {
                ts_to_us(own, time_base)
            } else if inner.frame_rate > 0.0 {
                (1_000_000.0 / inner.frame_rate) as i64
            } else {
                0
            }
        }
        RawFrame::Audio(frame) => {
            if frame.samples() > 0 && inner.sample_rate > 0 {
                (frame.samples() as i64 * 1_000_000) / inner.sample_rate as i64
            } else {
                0
            }
        }
    }
}

fn build_frame(
    inner: &mut SourceInner,
    raw: &RawFrame,
    pts_us: i64,
    duration_us: i64,
) -> Result<Arc<DecodedFrame>, PlayerError> {
    let payload = match raw {
        RawFrame::Video(frame) => {
            let converter = inner
                .converter
                .as_mut()
                .ok_or_else(|| PlayerError::Internal("video source without converter".into()))?;
            FramePayload::Video(Arc::new(converter.payload(frame)?))
        }
        RawFrame::Audio(frame) => FramePayload::Audio(Arc::new(decoder::audio_payload(frame)?)),
    };
    Ok(Arc::new(DecodedFrame {
        payload,
        pts_us,
        duration_us,
    }))
}

/// Sends one packet (or the EOF flush) and queues every frame the codec
/// yields. Per-packet errors are logged and skipped.
fn process_packet(
    shared: &SourceShared,
    inner: &mut SourceInner,
    packet: Option<&ffmpeg_next::Packet>,
) {
    if let Err(e) = inner.decoder.submit_packet(packet) {
        tracing::warn!("{} packet dropped: {e}", shared.kind.name());
        return;
    }

    loop {
        let raw = match inner.decoder.receive_frame() {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("{} frame skipped: {e}", shared.kind.name());
                break;
            }
        };

        let time_base = inner.demuxer.time_base();
        let duration_us = frame_duration_us(&raw, inner, time_base);

        let pts_src = raw.pts().or_else(|| packet.and_then(|p| p.pts()));
        let pts_us = match pts_src {
            Some(pts) => ts_to_us(pts, time_base),
            None => {
                let pts_us = inner.synthetic_pts_us;
                let step = if duration_us > 0 {
                    duration_us
                } else {
                    match shared.kind {
                        MediaKind::Video => FALLBACK_VIDEO_STEP_US,
                        MediaKind::Audio => FALLBACK_AUDIO_STEP_US,
                    }
                };
                inner.synthetic_pts_us += step;
                tracing::warn!(
                    "{} frame has no PTS, assigned synthetic {}us",
                    shared.kind.name(),
                    pts_us
                );
                pts_us
            }
        };

        match build_frame(inner, &raw, pts_us, duration_us) {
            Ok(frame) => {
                if !shared.queue.try_push(frame) {
                    tracing::warn!(
                        "{} frame queue full, dropping frame at {}us",
                        shared.kind.name(),
                        pts_us
                    );
                }
            }
            Err(e) => tracing::warn!("{} frame conversion failed: {e}", shared.kind.name()),
        }
    }
}

/// The decode worker. Exits when the source state becomes Stopped, or on its
/// own after the stream hit EOF and the queue drained.
fn decode_loop(shared: Arc<SourceShared>, inner: Arc<Mutex<SourceInner>>) {
    let mut packet_count = 0u64;
    let mut flushed = false;

    loop {
        match shared.state() {
            SourceState::Stopped => break,
            SourceState::Paused => {
                thread::sleep(PAUSE_POLL);
                continue;
            }
            SourceState::Running => {}
        }

        // Back pressure: hold off reading while the queue is at capacity.
        shared
            .queue
            .wait_for_space(|| shared.state() != SourceState::Running);
        if shared.state() != SourceState::Running {
            continue;
        }

        let mut guard = inner.lock();
        match guard.demuxer.next_packet() {
            Ok(Some(packet)) => {
                flushed = false;
                process_packet(&shared, &mut guard, Some(&packet));
                let queued = shared.queue.len();
                drop(guard);

                packet_count += 1;
                if packet_count % 30 == 0 {
                    tracing::debug!(
                        "{}: {} packets processed, {}/{} frames queued",
                        shared.kind.name(),
                        packet_count,
                        queued,
                        shared.queue.capacity()
                    );
                }
            }
            Ok(None) => {
                if guard.demuxer.is_eof() {
                    shared.eof.store(true, Ordering::Release);
                    if !flushed {
                        // Null packet drains the codec's remaining frames.
                        process_packet(&shared, &mut guard, None);
                        flushed = true;
                    }
                    drop(guard);

                    let drained = shared
                        .queue
                        .wait_for_drain(|| shared.state() != SourceState::Running);
                    if drained
                        && shared.eof.load(Ordering::Acquire)
                        && shared.state() == SourceState::Running
                    {
                        shared.set_state(SourceState::Stopped);
                        tracing::info!("{} stream decoding completed", shared.kind.name());
                        break;
                    }
                } else {
                    drop(guard);
                    thread::sleep(EMPTY_READ_POLL);
                }
            }
            Err(e) => {
                drop(guard);
                tracing::warn!("{} packet read failed: {e}", shared.kind.name());
                thread::sleep(EMPTY_READ_POLL);
            }
        }
    }

    tracing::debug!("{} decode thread exiting", shared.kind.name());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_state_round_trips_through_u8() {
        for state in [
            SourceState::Stopped,
            SourceState::Paused,
            SourceState::Running,
        ] {
            assert_eq!(SourceState::from_u8(state as u8), state);
        }
        assert_eq!(SourceState::from_u8(250), SourceState::Stopped);
    }

    #[test]
    fn queue_capacities_per_kind() {
        assert_eq!(VIDEO_QUEUE_CAPACITY, 30);
        assert_eq!(AUDIO_QUEUE_CAPACITY, 50);
    }

    #[test]
    fn open_missing_file_fails() {
        let err = StreamSource::open("/no/such/file.mkv", MediaKind::Video).unwrap_err();
        assert!(matches!(err, PlayerError::OpenFailed(_)));
    }
}
