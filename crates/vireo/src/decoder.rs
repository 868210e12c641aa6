//! Codec layer: a tagged decoder over the two media kinds, plus the
//! conversions that copy decoder-owned buffers into shareable payloads.
//!
//! The decode worker drives the send/receive pair: it submits one packet
//! (`None` to signal end of stream and enable draining) and then receives
//! every frame the codec currently has. Raw FFmpeg frames are converted to
//! [`VideoPayload`]/[`AudioPayload`] before they leave this layer.

use ffmpeg_next as ffmpeg;

use crate::error::PlayerError;
use crate::frame::{AudioPayload, MediaKind, PixelFormat, Plane, SampleFormat, VideoPayload};

/// A decoded frame still owned by FFmpeg.
pub enum RawFrame {
    /// Video frame
    Video(ffmpeg::frame::Video),
    /// Audio frame
    Audio(ffmpeg::frame::Audio),
}

impl RawFrame {
    /// Best-effort PTS in stream timebase units.
    pub fn pts(&self) -> Option<i64> {
        match self {
            RawFrame::Video(f) => f.pts(),
            RawFrame::Audio(f) => f.pts(),
        }
    }

    /// Frame duration in stream timebase units, 0 when unknown.
    pub fn duration(&self) -> i64 {
        // AVFrame::duration is not surfaced by the safe wrapper.
        unsafe {
            let ptr = match self {
                RawFrame::Video(f) => f.as_ptr(),
                RawFrame::Audio(f) => f.as_ptr(),
            };
            (*ptr).pkt_duration.max(0)
        }
    }
}

/// Decoder for one elementary stream, discriminated by media kind.
pub enum MediaDecoder {
    /// Video decoder
    Video(ffmpeg::decoder::Video),
    /// Audio decoder
    Audio(ffmpeg::decoder::Audio),
}

// SAFETY: FFmpeg codec contexts are not safe for concurrent access but can be
// moved between threads. The decoder lives behind the stream source's
// internal mutex; only one thread uses it at a time.
unsafe impl Send for MediaDecoder {}

impl MediaDecoder {
    /// Opens a decoder of `kind` from the stream's codec parameters.
    pub fn open(
        kind: MediaKind,
        parameters: ffmpeg::codec::Parameters,
    ) -> Result<Self, PlayerError> {
        let context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| PlayerError::OpenFailed(format!("codec context: {e}")))?;

        match kind {
            MediaKind::Video => {
                let decoder = context
                    .decoder()
                    .video()
                    .map_err(|e| PlayerError::OpenFailed(format!("video decoder: {e}")))?;
                tracing::info!(
                    "video codec opened: {}x{}, pixel format {:?}",
                    decoder.width(),
                    decoder.height(),
                    decoder.format()
                );
                Ok(MediaDecoder::Video(decoder))
            }
            MediaKind::Audio => {
                let decoder = context
                    .decoder()
                    .audio()
                    .map_err(|e| PlayerError::OpenFailed(format!("audio decoder: {e}")))?;
                tracing::info!(
                    "audio codec opened: {}Hz, {} channels, sample format {:?}",
                    decoder.rate(),
                    decoder.channels(),
                    decoder.format()
                );
                Ok(MediaDecoder::Audio(decoder))
            }
        }
    }

    /// Submits a packet; `None` signals end of stream and enables draining.
    pub fn submit_packet(&mut self, packet: Option<&ffmpeg::Packet>) -> Result<(), PlayerError> {
        let result = match (self, packet) {
            (MediaDecoder::Video(d), Some(p)) => d.send_packet(p),
            (MediaDecoder::Video(d), None) => d.send_eof(),
            (MediaDecoder::Audio(d), Some(p)) => d.send_packet(p),
            (MediaDecoder::Audio(d), None) => d.send_eof(),
        };
        result.map_err(|e| PlayerError::DecodeFailed(format!("send packet: {e}")))
    }

    /// Receives the next available frame. `Ok(None)` means the codec needs
    /// more input or has fully drained.
    pub fn receive_frame(&mut self) -> Result<Option<RawFrame>, PlayerError> {
        match self {
            MediaDecoder::Video(decoder) => {
                let mut frame = ffmpeg::frame::Video::empty();
                match decoder.receive_frame(&mut frame) {
                    Ok(()) => Ok(Some(RawFrame::Video(frame))),
                    Err(e) => map_receive_error(e),
                }
            }
            MediaDecoder::Audio(decoder) => {
                let mut frame = ffmpeg::frame::Audio::empty();
                match decoder.receive_frame(&mut frame) {
                    Ok(()) => Ok(Some(RawFrame::Audio(frame))),
                    Err(e) => map_receive_error(e),
                }
            }
        }
    }

    /// Discards the codec's internal buffers (used on seek).
    pub fn flush(&mut self) {
        match self {
            MediaDecoder::Video(d) => d.flush(),
            MediaDecoder::Audio(d) => d.flush(),
        }
    }
}

fn map_receive_error(e: ffmpeg::Error) -> Result<Option<RawFrame>, PlayerError> {
    match e {
        ffmpeg::Error::Eof => Ok(None),
        ffmpeg::Error::Other { errno } if errno == ffmpeg::error::EAGAIN => Ok(None),
        other => Err(PlayerError::DecodeFailed(other.to_string())),
    }
}

/// Maps an FFmpeg pixel format onto the payload formats the renderer accepts.
pub(crate) fn map_pixel_format(pixel: ffmpeg::format::Pixel) -> Option<PixelFormat> {
    use ffmpeg::format::Pixel;
    match pixel {
        Pixel::YUV420P | Pixel::YUVJ420P => Some(PixelFormat::Yuv420p),
        Pixel::YUV422P | Pixel::YUVJ422P => Some(PixelFormat::Yuv422p),
        Pixel::YUV444P | Pixel::YUVJ444P => Some(PixelFormat::Yuv444p),
        Pixel::NV12 => Some(PixelFormat::Nv12),
        _ => None,
    }
}

pub(crate) fn map_sample_format(sample: ffmpeg::format::Sample) -> Option<SampleFormat> {
    use ffmpeg::format::sample::Type;
    use ffmpeg::format::Sample;
    match sample {
        Sample::U8(Type::Packed) => Some(SampleFormat::U8),
        Sample::U8(Type::Planar) => Some(SampleFormat::U8p),
        Sample::I16(Type::Packed) => Some(SampleFormat::S16),
        Sample::I16(Type::Planar) => Some(SampleFormat::S16p),
        Sample::I32(Type::Packed) => Some(SampleFormat::S32),
        Sample::I32(Type::Planar) => Some(SampleFormat::S32p),
        Sample::I64(Type::Packed) => Some(SampleFormat::S64),
        Sample::I64(Type::Planar) => Some(SampleFormat::S64p),
        Sample::F32(Type::Packed) => Some(SampleFormat::F32),
        Sample::F32(Type::Planar) => Some(SampleFormat::F32p),
        Sample::F64(Type::Packed) => Some(SampleFormat::F64),
        Sample::F64(Type::Planar) => Some(SampleFormat::F64p),
        _ => None,
    }
}

pub(crate) fn to_ffmpeg_sample(format: SampleFormat) -> ffmpeg::format::Sample {
    use ffmpeg::format::sample::Type;
    use ffmpeg::format::Sample;
    match format {
        SampleFormat::U8 => Sample::U8(Type::Packed),
        SampleFormat::U8p => Sample::U8(Type::Planar),
        SampleFormat::S16 => Sample::I16(Type::Packed),
        SampleFormat::S16p => Sample::I16(Type::Planar),
        SampleFormat::S32 => Sample::I32(Type::Packed),
        SampleFormat::S32p => Sample::I32(Type::Planar),
        SampleFormat::S64 => Sample::I64(Type::Packed),
        SampleFormat::S64p => Sample::I64(Type::Planar),
        SampleFormat::F32 => Sample::F32(Type::Packed),
        SampleFormat::F32p => Sample::F32(Type::Planar),
        SampleFormat::F64 => Sample::F64(Type::Packed),
        SampleFormat::F64p => Sample::F64(Type::Planar),
    }
}

/// Source description a cached scaler was built for.
type ScalerSource = (ffmpeg::format::Pixel, u32, u32);

/// Converts decoded video frames whose pixel format the renderer does not
/// accept into YUV 4:2:0.
///
/// The destination is always YUV 4:2:0 at the frame's own dimensions, so the
/// cached scaler is keyed purely on the source description and rebuilt when
/// a frame arrives that no longer matches it (mid-stream parameter changes).
pub(crate) struct VideoConverter {
    scaler: Option<(ScalerSource, ffmpeg::software::scaling::Context)>,
}

// SAFETY: the scaling context is only touched by the thread that currently
// holds the stream source's internal mutex.
unsafe impl Send for VideoConverter {}

impl VideoConverter {
    pub(crate) fn new() -> Self {
        Self { scaler: None }
    }

    fn to_yuv420p(
        &mut self,
        frame: &ffmpeg::frame::Video,
    ) -> Result<ffmpeg::frame::Video, PlayerError> {
        let source: ScalerSource = (frame.format(), frame.width(), frame.height());

        if self.scaler.as_ref().map(|(built_for, _)| *built_for) != Some(source) {
            tracing::debug!(
                "building yuv420p scaler for {:?} {}x{} input",
                source.0,
                source.1,
                source.2
            );
            let ctx = ffmpeg::software::scaling::Context::get(
                source.0,
                source.1,
                source.2,
                ffmpeg::format::Pixel::YUV420P,
                source.1,
                source.2,
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| PlayerError::DecodeFailed(format!("create scaler: {e}")))?;
            self.scaler = Some((source, ctx));
        }

        let Some((_, scaler)) = self.scaler.as_mut() else {
            return Err(PlayerError::Internal("scaler not initialized".to_string()));
        };
        let mut converted = ffmpeg::frame::Video::empty();
        scaler
            .run(frame, &mut converted)
            .map_err(|e| PlayerError::DecodeFailed(format!("scale: {e}")))?;
        Ok(converted)
    }

    /// Copies `frame` into an owned payload, converting to YUV 4:2:0 first
    /// when its pixel format has no direct renderer mapping.
    pub(crate) fn payload(
        &mut self,
        frame: &ffmpeg::frame::Video,
    ) -> Result<VideoPayload, PlayerError> {
        if let Some(format) = map_pixel_format(frame.format()) {
            return Ok(copy_video_planes(frame, format));
        }

        let converted = self.to_yuv420p(frame)?;
        Ok(copy_video_planes(&converted, PixelFormat::Yuv420p))
    }
}

fn copy_video_planes(frame: &ffmpeg::frame::Video, format: PixelFormat) -> VideoPayload {
    let width = frame.width();
    let height = frame.height();
    let mut planes = Vec::with_capacity(format.num_planes());
    for i in 0..format.num_planes() {
        let stride = frame.stride(i);
        let plane_height = format.plane_height(i, height) as usize;
        let data = frame.data(i);
        let need = (stride * plane_height).min(data.len());
        planes.push(Plane {
            data: data[..need].to_vec(),
            stride,
        });
    }
    VideoPayload {
        format,
        width,
        height,
        planes,
    }
}

/// Copies a decoded audio frame into an owned payload, preserving its
/// native (possibly planar) layout for the resampler.
pub(crate) fn audio_payload(frame: &ffmpeg::frame::Audio) -> Result<AudioPayload, PlayerError> {
    let format = map_sample_format(frame.format()).ok_or_else(|| {
        PlayerError::DecodeFailed(format!("unsupported sample format {:?}", frame.format()))
    })?;

    let samples = frame.samples();
    let channels = frame.channels();
    let bytes_per_sample = format.bytes_per_sample();

    let (plane_count, plane_bytes) = if format.is_planar() {
        (channels as usize, samples * bytes_per_sample)
    } else {
        (1, samples * bytes_per_sample * channels as usize)
    };

    let mut planes = Vec::with_capacity(plane_count);
    for i in 0..plane_count {
        let data = frame.data(i);
        let need = plane_bytes.min(data.len());
        planes.push(data[..need].to_vec());
    }

    Ok(AudioPayload {
        format,
        sample_rate: frame.rate(),
        channels,
        layout_bits: frame.channel_layout().bits(),
        samples,
        planes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg::format::{sample::Type, Pixel, Sample};

    #[test]
    fn pixel_format_mapping_covers_planar_yuv() {
        assert_eq!(map_pixel_format(Pixel::YUV420P), Some(PixelFormat::Yuv420p));
        assert_eq!(map_pixel_format(Pixel::YUVJ420P), Some(PixelFormat::Yuv420p));
        assert_eq!(map_pixel_format(Pixel::NV12), Some(PixelFormat::Nv12));
        assert_eq!(map_pixel_format(Pixel::RGB24), None);
    }

    #[test]
    fn sample_format_mapping_round_trips() {
        let formats = [
            SampleFormat::U8,
            SampleFormat::S16,
            SampleFormat::S32,
            SampleFormat::F32,
            SampleFormat::F64,
            SampleFormat::S16p,
            SampleFormat::F32p,
        ];
        for format in formats {
            assert_eq!(map_sample_format(to_ffmpeg_sample(format)), Some(format));
        }
        assert_eq!(map_sample_format(Sample::None), None);
        assert_eq!(
            map_sample_format(Sample::F32(Type::Planar)),
            Some(SampleFormat::F32p)
        );
    }
}
