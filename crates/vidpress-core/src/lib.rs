// crates/vidpress-core/src/lib.rs
//
// Plain data and pure math for the compression pipeline. No ffmpeg, no
// threads of its own: everything here is testable without a media file.

pub mod cancel;
pub mod config;
pub mod error;
pub mod helpers;
pub mod media_types;
pub mod progress;
pub mod quality;
pub mod state;

pub use cancel::CancelToken;
pub use config::CompressOptions;
pub use error::CompressionError;
pub use helpers::geometry::{DisplayTransform, FrameSize, TargetGeometry};
pub use media_types::{CompressResult, CompressionOutput, SourceAsset, TrackKind};
pub use progress::{ProgressEvent, ProgressRange};
pub use quality::{QualityProfile, QualityTier};
