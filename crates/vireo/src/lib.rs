//! vireo: real-time audio/video playback engine.
//!
//! Reads a media container from local storage, decodes its elementary
//! streams on dedicated worker threads, and presents them synchronously: a
//! PCM ring buffer feeds the audio device callback and publishes the audio
//! clock, and the video presenter paces frames against that clock.
//!
//! - Decode plumbing: [`demuxer`], [`decoder`], [`stream_source`], [`frame_queue`]
//! - Audio path: [`pcm_ring`], [`audio_clock`], [`audio_output`]
//! - Presentation: [`presenter`], [`renderer`]
//! - Coordination: [`player`]
//!
//! The GPU surface is consumed behind [`renderer::FrameSink`]; this crate has
//! no windowing dependency.

pub mod audio_clock;
pub mod audio_output;
pub mod decoder;
pub mod demuxer;
pub mod error;
pub mod frame;
pub mod frame_queue;
pub mod pcm_ring;
pub mod player;
pub mod presenter;
pub mod renderer;
pub mod stream_source;

pub use audio_clock::AudioClock;
pub use audio_output::{AudioOutput, MAX_MIX_VOLUME};
pub use error::PlayerError;
pub use frame::{
    AudioPayload, DecodedFrame, FramePayload, MediaKind, PixelFormat, Plane, SampleFormat,
    VideoPayload,
};
pub use frame_queue::FrameQueue;
pub use pcm_ring::PcmRing;
pub use player::{Player, PlayerState, StateObserver, TimestampObserver};
pub use renderer::{FrameSink, HeadlessSink, WindowHandle};
pub use stream_source::{
    SourceState, StreamInfo, StreamSource, AUDIO_QUEUE_CAPACITY, VIDEO_QUEUE_CAPACITY,
};
