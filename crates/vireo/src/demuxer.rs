//! Container demultiplexer, one per stream source.
//!
//! Each [`Demuxer`] owns its own FFmpeg input context opened on the same file
//! and is locked onto the first stream of the requested kind. Packets of other
//! streams are skipped during reads.

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use crate::error::PlayerError;
use crate::frame::MediaKind;

/// Converts a stream-timebase timestamp to whole microseconds.
pub(crate) fn ts_to_us(ts: i64, time_base: (i32, i32)) -> i64 {
    if time_base.1 == 0 {
        return 0;
    }
    (ts as i128 * time_base.0 as i128 * 1_000_000 / time_base.1 as i128) as i64
}

/// Demuxer for a single elementary stream of a media file.
pub struct Demuxer {
    input: ffmpeg::format::context::Input,
    kind: MediaKind,
    stream_index: usize,
    time_base: (i32, i32),
    eof: bool,
}

// SAFETY: the FFmpeg input context is not safe for concurrent access, but it
// can be moved between threads. The demuxer lives behind the stream source's
// internal mutex, so only one thread touches it at a time.
unsafe impl Send for Demuxer {}

impl std::fmt::Debug for Demuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demuxer")
            .field("kind", &self.kind)
            .field("stream_index", &self.stream_index)
            .field("time_base", &self.time_base)
            .field("eof", &self.eof)
            .finish()
    }
}

impl Demuxer {
    /// Opens `path` and locks onto the first stream of `kind`.
    pub fn open(path: &str, kind: MediaKind) -> Result<Self, PlayerError> {
        if path.is_empty() {
            return Err(PlayerError::InvalidArgument("empty path".to_string()));
        }

        ffmpeg::init()
            .map_err(|e| PlayerError::OpenFailed(format!("ffmpeg init failed: {e}")))?;

        let input = ffmpeg::format::input(&path)
            .map_err(|e| PlayerError::OpenFailed(format!("could not open {path}: {e}")))?;

        let media_type = match kind {
            MediaKind::Video => ffmpeg::media::Type::Video,
            MediaKind::Audio => ffmpeg::media::Type::Audio,
        };

        let stream = input
            .streams()
            .find(|s| s.parameters().medium() == media_type)
            .ok_or_else(|| {
                PlayerError::OpenFailed(format!("no {} stream in {path}", kind.name()))
            })?;

        let stream_index = stream.index();
        let time_base = stream.time_base();
        let time_base = (time_base.0, time_base.1);

        tracing::info!(
            "opened {path}: {} stream index {}, timebase {}/{}, duration {:.3}s",
            kind.name(),
            stream_index,
            time_base.0,
            time_base.1,
            input.duration().max(0) as f64 / ffi::AV_TIME_BASE as f64,
        );

        Ok(Self {
            input,
            kind,
            stream_index,
            time_base,
            eof: false,
        })
    }

    /// Reads the next packet belonging to this demuxer's stream.
    ///
    /// Returns `Ok(None)` on end of file (and latches the EOF flag) or on a
    /// transient read error; hard read errors surface as `ReadPacketFailed`.
    pub fn next_packet(&mut self) -> Result<Option<ffmpeg::Packet>, PlayerError> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        return Ok(Some(packet));
                    }
                    // Other stream, keep reading.
                }
                Err(ffmpeg::Error::Eof) => {
                    if !self.eof {
                        tracing::info!("{} stream reached end of file", self.kind.name());
                    }
                    self.eof = true;
                    return Ok(None);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                    continue;
                }
                Err(e) => {
                    return Err(PlayerError::ReadPacketFailed(e.to_string()));
                }
            }
        }
    }

    /// Seeks so that decoding resumes at the keyframe at or before
    /// `target_us`. Clears the EOF flag.
    pub fn seek(&mut self, target_us: i64) -> Result<(), PlayerError> {
        tracing::debug!(
            "{} demuxer seeking to {}us (timebase {}/{})",
            self.kind.name(),
            target_us,
            self.time_base.0,
            self.time_base.1
        );

        // Bounding the range above by the target selects the nearest
        // keyframe at or before it (AVSEEK_FLAG_BACKWARD semantics).
        self.input
            .seek(target_us, ..target_us)
            .map_err(|e| PlayerError::SeekFailed(format!("seek to {target_us}us: {e}")))?;

        self.eof = false;
        Ok(())
    }

    /// Container duration in microseconds, falling back to the stream
    /// duration, else 0.
    pub fn duration_us(&self) -> i64 {
        let container = self.input.duration();
        if container > 0 {
            return container;
        }
        if let Some(stream) = self.input.stream(self.stream_index) {
            let d = stream.duration();
            if d > 0 {
                return ts_to_us(d, self.time_base);
            }
        }
        0
    }

    /// Codec parameters of the selected stream, for decoder initialization.
    pub fn codec_parameters(&self) -> Result<ffmpeg::codec::Parameters, PlayerError> {
        let stream = self
            .input
            .stream(self.stream_index)
            .ok_or_else(|| PlayerError::Internal("selected stream vanished".to_string()))?;
        Ok(stream.parameters())
    }

    /// Frame rate of the selected stream: average frame rate when present,
    /// else the real frame rate, else 0.
    pub fn frame_rate(&self) -> f64 {
        let Some(stream) = self.input.stream(self.stream_index) else {
            return 0.0;
        };
        let avg = stream.avg_frame_rate();
        if avg.0 != 0 && avg.1 != 0 {
            return avg.0 as f64 / avg.1 as f64;
        }
        let real = stream.rate();
        if real.0 != 0 && real.1 != 0 {
            return real.0 as f64 / real.1 as f64;
        }
        0.0
    }

    /// Stream timebase as a (numerator, denominator) pair.
    pub fn time_base(&self) -> (i32, i32) {
        self.time_base
    }

    /// Index of the selected stream in the container.
    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    /// True once the container has been read to the end.
    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_rescaling_to_microseconds() {
        // 90kHz MPEG timebase: 90_000 ticks is one second.
        assert_eq!(ts_to_us(90_000, (1, 90_000)), 1_000_000);
        assert_eq!(ts_to_us(45_000, (1, 90_000)), 500_000);
        // 1/1000 (milliseconds) timebase.
        assert_eq!(ts_to_us(1_500, (1, 1_000)), 1_500_000);
        // Degenerate timebase maps to zero rather than dividing by zero.
        assert_eq!(ts_to_us(123, (1, 0)), 0);
    }

    #[test]
    fn open_rejects_missing_file() {
        let err = Demuxer::open("/nonexistent/clip.mp4", MediaKind::Video).unwrap_err();
        assert!(matches!(err, PlayerError::OpenFailed(_)));
    }

    #[test]
    fn open_rejects_empty_path() {
        let err = Demuxer::open("", MediaKind::Audio).unwrap_err();
        assert!(matches!(err, PlayerError::InvalidArgument(_)));
    }
}
