//! Error types for the playback pipeline.

/// Errors surfaced by the playback pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerError {
    /// Bad path, out-of-range seek target, or missing required input
    InvalidArgument(String),
    /// Demuxer, decoder, or audio device failed to open
    OpenFailed(String),
    /// The audio device could not honour the requested spec exactly
    DeviceMismatch(String),
    /// Reading a packet from the container failed
    ReadPacketFailed(String),
    /// The codec reported an unrecoverable error
    DecodeFailed(String),
    /// Demuxer seek failed or no frames were decodable at the target
    SeekFailed(String),
    /// Allocation failure (frame clone, buffer resize)
    ResourceExhausted(String),
    /// An internal invariant was violated
    Internal(String),
}

impl std::fmt::Display for PlayerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::OpenFailed(msg) => write!(f, "open failed: {msg}"),
            Self::DeviceMismatch(msg) => write!(f, "audio device mismatch: {msg}"),
            Self::ReadPacketFailed(msg) => write!(f, "packet read failed: {msg}"),
            Self::DecodeFailed(msg) => write!(f, "decode failed: {msg}"),
            Self::SeekFailed(msg) => write!(f, "seek failed: {msg}"),
            Self::ResourceExhausted(msg) => write!(f, "resource exhausted: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PlayerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = PlayerError::OpenFailed("no audio stream".to_string());
        assert_eq!(err.to_string(), "open failed: no audio stream");

        let err = PlayerError::DeviceMismatch("48000Hz unsupported".to_string());
        assert!(err.to_string().contains("48000Hz"));
    }
}
