// crates/vidpress-core/src/error.rs
//
// Terminal failures of one compress() call. Every variant is final for that
// call; nothing inside the pipeline retries.

/// Why a compression did not produce an output file.
///
/// `Display` carries the underlying cause for logs; `description()` is the
/// short, user-facing string per kind.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The source could not be opened or probed at all.
    #[error("could not read source: {0:#}")]
    SourceUnreadable(#[source] anyhow::Error),

    /// The container has no decodable video stream, or it is zero-sized.
    #[error("video file has no video track")]
    NoVideoTrack,

    /// The destination container or an encoder rejected the computed settings.
    #[error("encoder configuration failed: {0:#}")]
    EncoderConfigurationFailed(#[source] anyhow::Error),

    /// A reader or writer failed after samples started flowing.
    #[error("encoding failed: {0:#}")]
    EncodingFailed(#[source] anyhow::Error),

    /// The caller signalled the cancel token.
    #[error("compression was cancelled")]
    Cancelled,

    #[error("unknown compression error: {0}")]
    Unknown(String),
}

impl CompressionError {
    /// Localizable message for the UI layer.
    pub fn description(&self) -> &'static str {
        match self {
            CompressionError::SourceUnreadable(_)           => "Could not open the selected video",
            CompressionError::NoVideoTrack                  => "Video file has no video track",
            CompressionError::EncoderConfigurationFailed(_) => "Failed to create video export session",
            CompressionError::EncodingFailed(_)             => "Video compression failed",
            CompressionError::Cancelled                     => "Compression was cancelled",
            CompressionError::Unknown(_)                    => "Unknown compression error",
        }
    }

    /// Callers suppress error UI for user-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CompressionError::Cancelled)
    }

    /// Stable machine-readable kind, used in JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            CompressionError::SourceUnreadable(_)           => "source_unreadable",
            CompressionError::NoVideoTrack                  => "no_video_track",
            CompressionError::EncoderConfigurationFailed(_) => "encoder_configuration_failed",
            CompressionError::EncodingFailed(_)             => "encoding_failed",
            CompressionError::Cancelled                     => "cancelled",
            CompressionError::Unknown(_)                    => "unknown",
        }
    }
}
