//! Video presenter: dequeues frames, paces them against the audio clock, and
//! hands pixel payloads to the frame sink.
//!
//! Audio is the master clock. Each frame's nominal delay is adjusted by the
//! sync bands, smoothed by a one-pole low-pass, and slept off before the next
//! iteration. Without audio the clock reads 0 and delays pass through the
//! filter uncorrected.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::frame::MediaKind;
use crate::player::{PlayerShared, PlayerState};
use crate::renderer::FrameSink;
use crate::stream_source::StreamSource;

/// Drift below this is left alone.
const AV_SYNC_THRESHOLD_MIN: f64 = 0.040;
/// Drift above this gets the hard correction.
const AV_SYNC_THRESHOLD_MAX: f64 = 0.100;
/// Video this far behind audio presents immediately (duplicate next tick).
const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.200;

/// Low-pass filter weights: `d = 0.9 * prev + 0.1 * current`.
const LOW_PASS_KEEP: f64 = 0.9;
const LOW_PASS_BLEND: f64 = 0.1;

/// Poll interval while the player is paused or audio is still draining.
const PAUSE_POLL: Duration = Duration::from_millis(10);
/// Poll interval when the video queue is momentarily empty.
const EMPTY_QUEUE_POLL: Duration = Duration::from_millis(5);

/// Adjusts the nominal per-frame delay by the A/V drift.
///
/// `diff` is `video_pts - audio_clock` in seconds; `nominal` is the frame's
/// own duration in seconds. Pure, so the band behavior is testable in
/// isolation.
pub(crate) fn sync_adjusted_delay(nominal: f64, diff: f64) -> f64 {
    if diff.abs() < AV_SYNC_THRESHOLD_MIN {
        // In sync, keep the frame's own pacing.
        nominal
    } else if diff.abs() > AV_SYNC_THRESHOLD_MAX {
        // Hard correction: stall when video leads, catch up when it lags.
        (nominal + diff).max(0.0)
    } else if diff > AV_SYNC_FRAMEDUP_THRESHOLD {
        0.0
    } else {
        nominal
    }
}

/// One-pole smoothing over successive delays; disabled until the filter has
/// a positive history.
pub(crate) fn low_pass(previous: f64, current: f64) -> f64 {
    if previous > 0.0 {
        previous * LOW_PASS_KEEP + current * LOW_PASS_BLEND
    } else {
        current
    }
}

/// Everything the presenter thread needs, captured at spawn.
pub(crate) struct PresenterContext {
    pub shared: Arc<PlayerShared>,
    pub video: Arc<StreamSource>,
    pub audio: Option<Arc<StreamSource>>,
    pub sink: Arc<dyn FrameSink>,
    pub duration_us: i64,
}

/// The presenter thread body.
pub(crate) fn presenter_loop(ctx: PresenterContext) {
    tracing::info!("video presenter thread started");
    debug_assert_eq!(ctx.video.kind(), MediaKind::Video);

    let frame_rate = ctx.video.frame_rate();
    let mut last_delay = 0.0f64;

    while ctx.shared.is_running() {
        if ctx.shared.state() == PlayerState::Paused {
            thread::sleep(PAUSE_POLL);
            continue;
        }

        if ctx.sink.window().close_requested() {
            tracing::info!("window close requested, presenter exiting");
            ctx.shared.stop_running();
            break;
        }

        let Some(frame) = ctx.video.next_frame() else {
            if ctx.video.is_eof() {
                match &ctx.audio {
                    Some(audio) if !audio.is_eof() => {
                        // Let audio finish before declaring the end.
                        thread::sleep(PAUSE_POLL);
                        continue;
                    }
                    _ => {
                        tracing::info!("video and audio streams finished");
                        ctx.shared.set_state(PlayerState::Stopped);
                        break;
                    }
                }
            } else {
                thread::sleep(EMPTY_QUEUE_POLL);
                continue;
            }
        };

        let video_pts = frame.pts_us;
        let audio_clock = ctx.shared.audio_clock_us();
        let diff = (video_pts - audio_clock) as f64 / 1_000_000.0;

        let nominal = if frame.duration_us > 0 {
            frame.duration_us as f64 / 1_000_000.0
        } else if frame_rate > 0.0 {
            1.0 / frame_rate
        } else {
            0.0
        };

        let mut delay = sync_adjusted_delay(nominal, diff);
        delay = low_pass(last_delay, delay);
        last_delay = delay;

        if let Some(payload) = frame.video() {
            ctx.sink.enqueue_frame(Arc::clone(payload));
        }

        ctx.shared.publish_timestamp(video_pts, ctx.duration_us);

        if delay > 0.0 {
            let delay_ms = (delay * 1000.0) as u64;
            if delay_ms > 0 {
                thread::sleep(Duration::from_millis(delay_ms));
            }
        }
    }

    tracing::info!("video presenter thread exiting");
    ctx.shared.set_state(PlayerState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_sync_band_leaves_delay_untouched() {
        let nominal = 1.0 / 30.0;
        assert_eq!(sync_adjusted_delay(nominal, 0.0), nominal);
        assert_eq!(sync_adjusted_delay(nominal, 0.039), nominal);
        assert_eq!(sync_adjusted_delay(nominal, -0.039), nominal);
    }

    #[test]
    fn hard_correction_band_adds_diff() {
        let nominal = 1.0 / 30.0;
        // Video ahead of audio: stall by the drift.
        let delayed = sync_adjusted_delay(nominal, 0.150);
        assert!((delayed - (nominal + 0.150)).abs() < 1e-9);
        // Video far behind: delay clamps at zero rather than going negative.
        assert_eq!(sync_adjusted_delay(nominal, -0.500), 0.0);
        // Just past the hard threshold on the lag side, still positive.
        let slight = sync_adjusted_delay(nominal, -0.120);
        assert_eq!(slight, 0.0_f64.max(nominal - 0.120));
    }

    #[test]
    fn middle_band_keeps_nominal_delay() {
        // Between 40ms and 100ms the chain falls through to the nominal
        // delay; the duplicate branch needs diff > 200ms which cannot hold
        // there.
        let nominal = 1.0 / 24.0;
        assert_eq!(sync_adjusted_delay(nominal, 0.070), nominal);
        assert_eq!(sync_adjusted_delay(nominal, -0.070), nominal);
    }

    #[test]
    fn band_decision_is_deterministic() {
        for &(diff, nominal) in &[
            (0.0, 0.033),
            (0.05, 0.033),
            (0.15, 0.033),
            (-0.15, 0.033),
            (0.3, 0.042),
        ] {
            let a = sync_adjusted_delay(nominal, diff);
            let b = sync_adjusted_delay(nominal, diff);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn low_pass_passes_through_without_history() {
        assert_eq!(low_pass(0.0, 0.033), 0.033);
        assert_eq!(low_pass(-1.0, 0.033), 0.033);
    }

    #[test]
    fn low_pass_converges_geometrically() {
        // With a constant input, the error to the target shrinks by 0.9 each
        // step.
        let target: f64 = 0.040;
        let mut delay = 0.100;
        let mut error = (delay - target).abs();
        for _ in 0..50 {
            delay = low_pass(delay, target);
            let next_error = (delay - target).abs();
            assert!(next_error <= error * LOW_PASS_KEEP + 1e-12);
            error = next_error;
        }
        assert!(error < 1e-3);
    }
}
