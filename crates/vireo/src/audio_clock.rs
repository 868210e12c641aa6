//! The audio master clock.
//!
//! Three atomic scalars published by the audio side and read by the video
//! presenter: the PTS of the first sample in the ring (`base_pts_us`), the
//! number of output sample frames drained by the device since the last reset
//! (`consumed_samples`), and the derived clock value
//! `base + consumed * 1_000_000 / sample_rate`.
//!
//! The derived value is stored with release ordering after being computed
//! from both inputs, so a reader either sees the pre-callback snapshot or a
//! consistent post-callback pair.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Shared audio clock state. One instance per [`crate::AudioOutput`].
pub struct AudioClock {
    base_pts_us: AtomicI64,
    consumed_samples: AtomicU64,
    clock_us: AtomicI64,
    /// Armed by [`reset`](Self::reset); the producer latches the first frame's
    /// PTS as the new base while this is set.
    needs_base: AtomicBool,
    sample_rate: u32,
}

impl AudioClock {
    /// Creates a clock for a stream at `sample_rate` Hz.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            base_pts_us: AtomicI64::new(0),
            consumed_samples: AtomicU64::new(0),
            clock_us: AtomicI64::new(0),
            needs_base: AtomicBool::new(true),
            sample_rate,
        }
    }

    /// Current clock value in microseconds.
    pub fn value_us(&self) -> i64 {
        self.clock_us.load(Ordering::Acquire)
    }

    /// Advances the clock by `frames` output sample frames drained by the
    /// device callback, then republishes the derived value.
    pub fn advance(&self, frames: u64) {
        let consumed = self.consumed_samples.fetch_add(frames, Ordering::AcqRel) + frames;
        let base = self.base_pts_us.load(Ordering::Acquire);
        if self.sample_rate > 0 {
            let elapsed = (consumed as i128 * 1_000_000 / self.sample_rate as i128) as i64;
            self.clock_us.store(base + elapsed, Ordering::Release);
        }
    }

    /// Latches `pts_us` as the base timestamp if a reset armed the latch.
    /// Called by the producer with the PTS of the first frame it receives
    /// after a reset.
    pub fn publish_base(&self, pts_us: i64) {
        if self.needs_base.swap(false, Ordering::AcqRel) {
            self.base_pts_us.store(pts_us, Ordering::Release);
            tracing::debug!("audio clock base set to {}us", pts_us);
        }
    }

    /// Reinitializes the clock to `target_us` and re-arms the base latch.
    /// Called on seek, with the device paused and the ring cleared.
    pub fn reset(&self, target_us: i64) {
        self.consumed_samples.store(0, Ordering::Release);
        self.base_pts_us.store(target_us, Ordering::Release);
        self.clock_us.store(target_us, Ordering::Release);
        self.needs_base.store(true, Ordering::Release);
    }

    /// Total output sample frames consumed since the last reset.
    pub fn consumed_samples(&self) -> u64 {
        self.consumed_samples.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_publishes_target_immediately() {
        let clock = AudioClock::new(48_000);
        clock.reset(2_500_000);
        assert_eq!(clock.value_us(), 2_500_000);
        assert_eq!(clock.consumed_samples(), 0);
    }

    #[test]
    fn advance_derives_from_base_and_rate() {
        let clock = AudioClock::new(48_000);
        clock.reset(1_000_000);
        clock.publish_base(1_000_000);

        // 48_000 frames at 48kHz is exactly one second.
        clock.advance(48_000);
        assert_eq!(clock.value_us(), 2_000_000);

        clock.advance(24_000);
        assert_eq!(clock.value_us(), 2_500_000);
    }

    #[test]
    fn clock_is_non_decreasing_while_unpaused() {
        let clock = AudioClock::new(44_100);
        clock.reset(0);
        clock.publish_base(0);
        let mut last = clock.value_us();
        for _ in 0..100 {
            clock.advance(441);
            let now = clock.value_us();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn base_latch_consumed_once_per_reset() {
        let clock = AudioClock::new(48_000);
        clock.reset(5_000_000);

        // First frame after the reset lands slightly past the target.
        clock.publish_base(5_020_000);
        clock.advance(48);
        assert_eq!(clock.value_us(), 5_020_000 + 1_000);

        // Later frames must not move the base.
        clock.publish_base(9_999_999);
        clock.advance(48);
        assert_eq!(clock.value_us(), 5_020_000 + 2_000);
    }
}
