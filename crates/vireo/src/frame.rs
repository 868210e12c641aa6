//! Decoded frame types shared between decode workers and their consumers.
//!
//! Frames are copied out of decoder-owned buffers at the decode boundary and
//! wrapped in [`DecodedFrame`]; from there they travel by `Arc`, so the last
//! holder (audio producer or video presenter) releases the storage. Raw FFmpeg
//! frames never leave the worker that decoded them.

use std::sync::Arc;

/// Which elementary stream a source, demuxer, or decoder operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Video stream
    Video,
    /// Audio stream
    Audio,
}

impl MediaKind {
    /// Lowercase name for log messages.
    pub fn name(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// Pixel format of a decoded video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar (most common video format)
    Yuv420p,
    /// YUV 4:2:2 planar
    Yuv422p,
    /// YUV 4:4:4 planar
    Yuv444p,
    /// NV12 (Y plane + interleaved UV, common for hardware decoders)
    Nv12,
}

impl PixelFormat {
    /// Returns the number of planes for this format.
    pub fn num_planes(&self) -> usize {
        match self {
            PixelFormat::Yuv420p | PixelFormat::Yuv422p | PixelFormat::Yuv444p => 3,
            PixelFormat::Nv12 => 2,
        }
    }

    /// Height of plane `index` for a frame of the given height.
    pub fn plane_height(&self, index: usize, height: u32) -> u32 {
        match self {
            PixelFormat::Yuv420p => {
                if index == 0 {
                    height
                } else {
                    height.div_ceil(2)
                }
            }
            PixelFormat::Nv12 => {
                if index == 0 {
                    height
                } else {
                    height.div_ceil(2)
                }
            }
            PixelFormat::Yuv422p | PixelFormat::Yuv444p => height,
        }
    }
}

/// Sample format of a decoded audio frame, FFmpeg naming (`p` = planar).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    S64,
    F32,
    F64,
    U8p,
    S16p,
    S32p,
    S64p,
    F32p,
    F64p,
}

impl SampleFormat {
    /// Bytes per single sample of one channel.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::U8p => 1,
            SampleFormat::S16 | SampleFormat::S16p => 2,
            SampleFormat::S32 | SampleFormat::S32p | SampleFormat::F32 | SampleFormat::F32p => 4,
            SampleFormat::S64 | SampleFormat::S64p | SampleFormat::F64 | SampleFormat::F64p => 8,
        }
    }

    /// True when each channel lives in its own plane.
    pub fn is_planar(&self) -> bool {
        matches!(
            self,
            SampleFormat::U8p
                | SampleFormat::S16p
                | SampleFormat::S32p
                | SampleFormat::S64p
                | SampleFormat::F32p
                | SampleFormat::F64p
        )
    }
}

/// A single plane of pixel data.
#[derive(Debug, Clone)]
pub struct Plane {
    /// Raw pixel data
    pub data: Vec<u8>,
    /// Stride (bytes per row, may include padding)
    pub stride: usize,
}

/// Decoded video pixel planes.
#[derive(Debug, Clone)]
pub struct VideoPayload {
    /// Pixel format of the planes
    pub format: PixelFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// One entry per plane, `format.num_planes()` long
    pub planes: Vec<Plane>,
}

/// Decoded audio samples in the decoder's native layout.
#[derive(Debug, Clone)]
pub struct AudioPayload {
    /// Sample format as delivered by the decoder
    pub format: SampleFormat,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Channel layout bit mask (0 = unknown, derive from channel count)
    pub layout_bits: u64,
    /// Number of samples per channel
    pub samples: usize,
    /// Planar: one buffer per channel; packed: a single interleaved buffer
    pub planes: Vec<Vec<u8>>,
}

/// Payload of a decoded frame.
#[derive(Debug, Clone)]
pub enum FramePayload {
    /// Video pixel planes
    Video(Arc<VideoPayload>),
    /// Audio samples
    Audio(Arc<AudioPayload>),
}

/// A timestamped decoded frame.
///
/// `pts_us` and `duration_us` are whole microseconds in the media's global
/// timebase. Frames with no upstream PTS carry a synthetic one assigned by the
/// decode worker.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Frame payload, reference counted
    pub payload: FramePayload,
    /// Presentation timestamp in microseconds
    pub pts_us: i64,
    /// Display/playback duration in microseconds
    pub duration_us: i64,
}

impl DecodedFrame {
    /// Returns the video payload, if this is a video frame.
    pub fn video(&self) -> Option<&Arc<VideoPayload>> {
        match &self.payload {
            FramePayload::Video(payload) => Some(payload),
            FramePayload::Audio(_) => None,
        }
    }

    /// Returns the audio payload, if this is an audio frame.
    pub fn audio(&self) -> Option<&Arc<AudioPayload>> {
        match &self.payload {
            FramePayload::Audio(payload) => Some(payload),
            FramePayload::Video(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_counts() {
        assert_eq!(PixelFormat::Yuv420p.num_planes(), 3);
        assert_eq!(PixelFormat::Nv12.num_planes(), 2);
    }

    #[test]
    fn chroma_plane_heights_round_up() {
        assert_eq!(PixelFormat::Yuv420p.plane_height(0, 1080), 1080);
        assert_eq!(PixelFormat::Yuv420p.plane_height(1, 1080), 540);
        assert_eq!(PixelFormat::Yuv420p.plane_height(1, 1081), 541);
        assert_eq!(PixelFormat::Yuv444p.plane_height(2, 720), 720);
    }

    #[test]
    fn sample_format_properties() {
        assert_eq!(SampleFormat::S16.bytes_per_sample(), 2);
        assert_eq!(SampleFormat::F32p.bytes_per_sample(), 4);
        assert!(SampleFormat::F32p.is_planar());
        assert!(!SampleFormat::S16.is_planar());
    }
}
