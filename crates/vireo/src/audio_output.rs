//! Audio output: device, resampler, producer loop, and the realtime fill
//! path that services the device callback from the PCM ring.
//!
//! The device is opened at the source's native rate and channel count with a
//! fixed interleaved 16-bit format; anything the device cannot honour exactly
//! is a [`PlayerError::DeviceMismatch`]. A producer thread pulls decoded
//! frames from the audio stream source, converts them through the resampler
//! (used even when formats already match, to absorb planar layouts) and
//! feeds the ring. The callback never allocates, never logs, and substitutes
//! silence instead of returning errors.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ffmpeg_next as ffmpeg;

use crate::audio_clock::AudioClock;
use crate::decoder::to_ffmpeg_sample;
use crate::error::PlayerError;
use crate::frame::AudioPayload;
use crate::pcm_ring::PcmRing;
use crate::stream_source::{StreamInfo, StreamSource};

/// Full-scale volume in mixer units (a volume of 1.0 maps here).
pub const MAX_MIX_VOLUME: i32 = 128;

/// Device buffer size in sample frames.
const DEVICE_BUFFER_FRAMES: u32 = 1024;

/// Ring capacity in seconds of audio.
const RING_SECONDS: usize = 2;

/// Total time the producer retries a full ring before dropping the buffer.
const RING_PUSH_TIMEOUT: Duration = Duration::from_millis(200);
/// Sleep between ring push retries.
const RING_PUSH_RETRY: Duration = Duration::from_millis(5);
/// Poll interval while the output is paused or the source is at EOF.
const PAUSE_POLL: Duration = Duration::from_millis(10);
/// Poll interval after an empty (non-EOF) source read.
const EMPTY_SOURCE_POLL: Duration = Duration::from_millis(5);

/// Maps a normalized volume to mixer units: NaN plays full scale, everything
/// else clamps to [0, 1] and rounds.
fn volume_to_mix(norm: f64) -> i32 {
    let norm = if norm.is_nan() { 1.0 } else { norm };
    (norm.clamp(0.0, 1.0) * MAX_MIX_VOLUME as f64).round() as i32
}

/// State shared between the producer thread, the device callback, and the
/// controller.
struct OutputShared {
    ring: PcmRing,
    clock: Arc<AudioClock>,
    paused: AtomicBool,
    stopped: AtomicBool,
    playback_finished: AtomicBool,
    volume: AtomicI32,
    bytes_per_frame: usize,
}

/// The realtime fill path, owned by the device callback closure.
///
/// Kept device-independent so tests can drive it directly.
struct DeviceFeeder {
    shared: Arc<OutputShared>,
    /// Preallocated staging buffer; the callback never allocates.
    scratch: Vec<u8>,
}

impl DeviceFeeder {
    fn new(shared: Arc<OutputShared>) -> Self {
        Self {
            shared,
            scratch: vec![0u8; 16 * 1024],
        }
    }

    /// Fills `data` from the ring: zero-fill first, then pop in chunks,
    /// advancing the audio clock per chunk and scaling by the volume.
    fn fill(&mut self, data: &mut [i16]) {
        data.fill(0);

        let shared = &self.shared;
        if shared.paused.load(Ordering::Acquire) || shared.stopped.load(Ordering::Acquire) {
            return;
        }

        let bytes_per_frame = shared.bytes_per_frame;
        let want_bytes = data.len() * 2;
        let vol = shared.volume.load(Ordering::Acquire);
        let mut filled_samples = 0usize;

        while filled_samples * 2 < want_bytes {
            let chunk = (want_bytes - filled_samples * 2).min(self.scratch.len());
            let got = shared.ring.pop(&mut self.scratch[..chunk]);
            if got == 0 {
                break;
            }

            shared.clock.advance((got / bytes_per_frame) as u64);

            for (i, pair) in self.scratch[..got].chunks_exact(2).enumerate() {
                let mut sample = i16::from_ne_bytes([pair[0], pair[1]]);
                if vol < MAX_MIX_VOLUME {
                    sample = ((sample as i32 * vol) / MAX_MIX_VOLUME) as i16;
                }
                data[filled_samples + i] = sample;
            }
            filled_samples += got / 2;
        }
    }
}

/// Converts decoded audio frames to interleaved S16 at the device rate.
///
/// Configured once at initialization from the source's native parameters.
struct Resampler {
    ctx: ffmpeg::software::resampling::Context,
    layout: ffmpeg::ChannelLayout,
    sample_rate: u32,
    channels: u16,
}

// SAFETY: the resampling context is owned by the producer thread after
// construction; no other thread touches it.
unsafe impl Send for Resampler {}

impl Resampler {
    fn new(
        format: crate::frame::SampleFormat,
        sample_rate: u32,
        channels: u16,
        layout_bits: u64,
    ) -> Result<Self, PlayerError> {
        let layout = if layout_bits != 0 {
            ffmpeg::ChannelLayout::from_bits_truncate(layout_bits)
        } else {
            ffmpeg::ChannelLayout::default(channels as i32)
        };

        let out_format =
            ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed);
        let ctx = ffmpeg::software::resampling::Context::get(
            to_ffmpeg_sample(format),
            layout,
            sample_rate,
            out_format,
            layout,
            sample_rate,
        )
        .map_err(|e| PlayerError::OpenFailed(format!("resampler: {e}")))?;

        Ok(Self {
            ctx,
            layout,
            sample_rate,
            channels,
        })
    }

    /// Converts one payload to interleaved S16 bytes. The output is sized as
    /// `(delay + in_samples) * out_rate / in_rate`, rounded up.
    fn convert(&mut self, payload: &AudioPayload) -> Result<Vec<u8>, PlayerError> {
        if payload.samples == 0 {
            return Ok(Vec::new());
        }

        let mut input = ffmpeg::frame::Audio::new(
            to_ffmpeg_sample(payload.format),
            payload.samples,
            self.layout,
        );
        input.set_rate(payload.sample_rate);
        for (i, plane) in payload.planes.iter().enumerate() {
            let dst = input.data_mut(i);
            let n = plane.len().min(dst.len());
            dst[..n].copy_from_slice(&plane[..n]);
        }

        let in_rate = payload.sample_rate.max(1) as i64;
        let out_rate = self.sample_rate as i64;
        let delay = self.ctx.delay().map(|d| d.input).unwrap_or(0);
        let max_out =
            ((delay + payload.samples as i64) * out_rate + in_rate - 1) / in_rate;

        let mut output = ffmpeg::frame::Audio::new(
            ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed),
            max_out.max(1) as usize,
            self.layout,
        );
        output.set_rate(self.sample_rate);

        self.ctx
            .run(&input, &mut output)
            .map_err(|e| PlayerError::DecodeFailed(format!("resample: {e}")))?;

        let produced = output.samples();
        let bytes = produced * self.channels as usize * 2;
        let data = output.data(0);
        Ok(data[..bytes.min(data.len())].to_vec())
    }
}

/// Owns the audio device, the PCM ring, the audio clock, and the producer
/// thread feeding the ring from the audio stream source.
pub struct AudioOutput {
    shared: Arc<OutputShared>,
    stream: Option<cpal::Stream>,
    producer: Option<JoinHandle<()>>,
    sample_rate: u32,
    channels: u16,
}

impl AudioOutput {
    /// Opens the default output device for `source` and starts the producer.
    /// The device starts paused; [`resume`](Self::resume) unpauses it.
    pub fn new(source: Arc<StreamSource>) -> Result<Self, PlayerError> {
        let StreamInfo::Audio {
            sample_rate,
            channels,
            sample_format,
            layout_bits,
        } = *source.info()
        else {
            return Err(PlayerError::InvalidArgument(
                "audio output requires an audio stream source".to_string(),
            ));
        };

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            PlayerError::OpenFailed("no audio output device available".to_string())
        })?;

        if !device_supports(&device, channels, sample_rate) {
            return Err(PlayerError::DeviceMismatch(format!(
                "{}Hz / {} channels / s16 not supported by the output device",
                sample_rate, channels
            )));
        }

        let bytes_per_frame = channels as usize * 2;
        let ring_bytes = sample_rate as usize * bytes_per_frame * RING_SECONDS;

        let shared = Arc::new(OutputShared {
            ring: PcmRing::new(ring_bytes),
            clock: Arc::new(AudioClock::new(sample_rate)),
            paused: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            playback_finished: AtomicBool::new(false),
            volume: AtomicI32::new(MAX_MIX_VOLUME),
            bytes_per_frame,
        });

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Fixed(DEVICE_BUFFER_FRAMES),
        };

        let mut feeder = DeviceFeeder::new(Arc::clone(&shared));
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| feeder.fill(data),
                |err| tracing::error!("audio device error: {err}"),
                None,
            )
            .map_err(|e| PlayerError::OpenFailed(format!("build output stream: {e}")))?;
        stream.pause().ok(); // unpaused by play()

        let resampler = Resampler::new(sample_format, sample_rate, channels, layout_bits)?;

        let producer = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || producer_loop(shared, source, resampler))
        };

        tracing::info!(
            "audio output ready: {}Hz, {} channels, ring {} bytes",
            sample_rate,
            channels,
            shared.ring.capacity()
        );

        Ok(Self {
            shared,
            stream: Some(stream),
            producer: Some(producer),
            sample_rate,
            channels,
        })
    }

    /// Pauses the device and the producer.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.pause() {
                tracing::warn!("device pause failed: {e}");
            }
        }
    }

    /// Unpauses the device and the producer.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.play() {
                tracing::warn!("device resume failed: {e}");
            }
        }
    }

    /// True while the output is paused.
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// The published audio clock.
    pub fn clock(&self) -> Arc<AudioClock> {
        Arc::clone(&self.shared.clock)
    }

    /// Current clock value in microseconds.
    pub fn audio_clock_us(&self) -> i64 {
        self.shared.clock.value_us()
    }

    /// True once the source drained and the producer has nothing left.
    pub fn playback_finished(&self) -> bool {
        self.shared.playback_finished.load(Ordering::Acquire)
    }

    /// Reinitializes the clock to `target_us` after a seek: pauses the
    /// device, clears the ring, resets the clock triple, clears the finished
    /// flag, and unpauses the device so the producer refills from the new
    /// position.
    pub fn reset_clock(&self, target_us: i64) {
        if let Some(stream) = &self.stream {
            stream.pause().ok();
        }
        self.shared.ring.clear();
        self.shared.clock.reset(target_us);
        self.shared.playback_finished.store(false, Ordering::Release);
        if let Some(stream) = &self.stream {
            stream.play().ok();
        }
        tracing::info!("audio clock reset to {}us", target_us);
    }

    /// Sets the volume from a normalized value in [0, 1]; NaN means full.
    pub fn set_volume(&self, norm: f64) {
        let mix = volume_to_mix(norm);
        self.shared.volume.store(mix, Ordering::Release);
        tracing::info!("volume set to {mix}/{MAX_MIX_VOLUME}");
    }

    /// Current volume as a normalized value.
    pub fn volume(&self) -> f64 {
        self.shared.volume.load(Ordering::Acquire) as f64 / MAX_MIX_VOLUME as f64
    }

    /// Native sample rate of the opened device stream.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count of the opened device stream.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Stops the producer, closes the device, and zeroes all clock state.
    pub fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
        // Dropping the stream closes the device.
        self.stream.take();
        self.shared.ring.clear();
        self.shared.clock.reset(0);
        self.shared.playback_finished.store(false, Ordering::Release);
        tracing::info!("audio output stopped");
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn device_supports(device: &cpal::Device, channels: u16, sample_rate: u32) -> bool {
    let Ok(configs) = device.supported_output_configs() else {
        return false;
    };
    configs.into_iter().any(|cfg| {
        cfg.channels() == channels
            && cfg.sample_format() == cpal::SampleFormat::I16
            && sample_rate >= cfg.min_sample_rate().0
            && sample_rate <= cfg.max_sample_rate().0
    })
}

/// The producer: pulls frames from the audio source, converts them, and
/// pushes into the ring with a bounded retry.
fn producer_loop(shared: Arc<OutputShared>, source: Arc<StreamSource>, mut resampler: Resampler) {
    tracing::debug!("audio producer thread started");

    while !shared.stopped.load(Ordering::Acquire)
        && !shared.playback_finished.load(Ordering::Acquire)
    {
        if shared.paused.load(Ordering::Acquire) {
            thread::sleep(PAUSE_POLL);
            continue;
        }

        let Some(frame) = source.next_frame() else {
            if source.is_eof() {
                shared.playback_finished.store(true, Ordering::Release);
                tracing::info!("audio playback finished");
                thread::sleep(PAUSE_POLL);
            } else {
                thread::sleep(EMPTY_SOURCE_POLL);
            }
            continue;
        };

        let Some(payload) = frame.audio() else {
            continue;
        };
        let bytes = match resampler.convert(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("audio conversion failed: {e}");
                continue;
            }
        };
        if bytes.is_empty() {
            continue;
        }

        // The first frame after a clock reset defines the ring's base PTS.
        shared.clock.publish_base(frame.pts_us);

        let mut offset = 0usize;
        let wait_start = Instant::now();
        while offset < bytes.len()
            && !shared.stopped.load(Ordering::Acquire)
            && !shared.paused.load(Ordering::Acquire)
        {
            let pushed = shared.ring.push(&bytes[offset..]);
            if pushed > 0 {
                offset += pushed;
            } else {
                thread::sleep(RING_PUSH_RETRY);
                if wait_start.elapsed() > RING_PUSH_TIMEOUT {
                    tracing::warn!(
                        "ring full for {}ms, dropping {} bytes of audio",
                        RING_PUSH_TIMEOUT.as_millis(),
                        bytes.len() - offset
                    );
                    break;
                }
            }
        }
    }

    tracing::debug!("audio producer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shared(channels: usize) -> Arc<OutputShared> {
        Arc::new(OutputShared {
            ring: PcmRing::new(48_000 * channels * 2),
            clock: Arc::new(AudioClock::new(48_000)),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            playback_finished: AtomicBool::new(false),
            volume: AtomicI32::new(MAX_MIX_VOLUME),
            bytes_per_frame: channels * 2,
        })
    }

    fn push_samples(shared: &OutputShared, samples: &[i16]) {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            bytes.extend_from_slice(&s.to_ne_bytes());
        }
        assert_eq!(shared.ring.push(&bytes), bytes.len());
    }

    #[test]
    fn volume_mapping_clamps_and_rounds() {
        assert_eq!(volume_to_mix(0.0), 0);
        assert_eq!(volume_to_mix(1.0), MAX_MIX_VOLUME);
        assert_eq!(volume_to_mix(-3.0), 0);
        assert_eq!(volume_to_mix(2.0), MAX_MIX_VOLUME);
        assert_eq!(volume_to_mix(0.5), 64);
        assert_eq!(volume_to_mix(f64::NAN), MAX_MIX_VOLUME);
    }

    #[test]
    fn fill_passes_samples_through_at_full_volume() {
        let shared = test_shared(2);
        let mut feeder = DeviceFeeder::new(Arc::clone(&shared));
        push_samples(&shared, &[100, -200, 300, -400]);

        let mut out = [0i16; 4];
        feeder.fill(&mut out);
        assert_eq!(out, [100, -200, 300, -400]);
        // Two stereo frames were consumed.
        assert_eq!(shared.clock.consumed_samples(), 2);
    }

    #[test]
    fn fill_zero_fills_when_paused() {
        let shared = test_shared(2);
        shared.paused.store(true, Ordering::Release);
        let mut feeder = DeviceFeeder::new(Arc::clone(&shared));
        push_samples(&shared, &[1000, 1000]);

        let mut out = [7i16; 2];
        feeder.fill(&mut out);
        assert_eq!(out, [0, 0]);
        assert_eq!(shared.clock.consumed_samples(), 0, "paused must not drain");
    }

    #[test]
    fn fill_scales_by_volume_and_mutes_at_zero() {
        let shared = test_shared(1);
        let mut feeder = DeviceFeeder::new(Arc::clone(&shared));

        shared.volume.store(64, Ordering::Release);
        push_samples(&shared, &[1000, -1000]);
        let mut out = [0i16; 2];
        feeder.fill(&mut out);
        assert_eq!(out, [500, -500]);

        shared.volume.store(0, Ordering::Release);
        push_samples(&shared, &[1000, -1000]);
        let mut out = [1i16; 2];
        feeder.fill(&mut out);
        assert_eq!(out, [0, 0], "volume 0 must produce silence");
        // Samples were still drained, so the clock keeps advancing.
        assert_eq!(shared.clock.consumed_samples(), 4);
    }

    #[test]
    fn fill_handles_underrun_with_silence_tail() {
        let shared = test_shared(1);
        let mut feeder = DeviceFeeder::new(Arc::clone(&shared));
        push_samples(&shared, &[11, 22]);

        let mut out = [9i16; 6];
        feeder.fill(&mut out);
        assert_eq!(out, [11, 22, 0, 0, 0, 0]);
    }

    #[test]
    fn fill_advances_clock_from_base() {
        let shared = test_shared(2);
        let mut feeder = DeviceFeeder::new(Arc::clone(&shared));
        shared.clock.reset(1_000_000);
        shared.clock.publish_base(1_000_000);

        // 4800 stereo frames = 100ms at 48kHz.
        let samples = vec![1i16; 9600];
        push_samples(&shared, &samples);
        let mut out = vec![0i16; 9600];
        feeder.fill(&mut out);
        assert_eq!(shared.clock.value_us(), 1_100_000);
    }
}
