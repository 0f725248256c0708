// crates/vidpress-core/src/media_types.rs
//
// Types that flow between vidpress-media and its callers.
// No ffmpeg here, just plain data.

use std::path::PathBuf;
use uuid::Uuid;

use crate::helpers::geometry::{DisplayTransform, FrameSize, TargetGeometry};
use crate::quality::QualityTier;

/// Read-only description of the input container, built once by the probe.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceAsset {
    pub path:          PathBuf,
    /// Container duration in seconds (falls back to the video stream's).
    pub duration_secs: f64,
    /// Container start time in seconds. Track timestamps are rebased on it
    /// so audio/video offsets survive into the output.
    pub start_secs:    f64,
    /// Video frame size as stored, before the display transform.
    pub natural_size:  FrameSize,
    pub transform:     DisplayTransform,
    pub has_audio:     bool,
    /// Size on disk in bytes; 0 when the filesystem would not say.
    pub file_size:     u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn label(self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

/// Successful result of compress(): a fresh file the caller now owns.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressionOutput {
    pub path:            PathBuf,
    pub tier:            QualityTier,
    /// `None` for passthrough, which keeps the source dimensions.
    pub geometry:        Option<TargetGeometry>,
    pub original_size:   u64,
    pub compressed_size: u64,
}

impl CompressionOutput {
    /// How much smaller the output is, in whole percent. Negative when the
    /// output grew (passthrough of an already-tight file can do that).
    pub fn reduction_percent(&self) -> i64 {
        if self.original_size == 0 {
            return 0;
        }
        ((1.0 - self.compressed_size as f64 / self.original_size as f64) * 100.0).round() as i64
    }
}

/// Results sent from the CompressWorker background threads to the caller.
#[derive(Debug)]
pub enum CompressResult {
    Progress { job_id: Uuid, fraction: f64, message: String },
    Done     { job_id: Uuid, output: CompressionOutput },
    Error    { job_id: Uuid, error: crate::error::CompressionError },
}

impl CompressResult {
    pub fn job_id(&self) -> Uuid {
        match self {
            CompressResult::Progress { job_id, .. }
            | CompressResult::Done { job_id, .. }
            | CompressResult::Error { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CompressResult::Progress { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(original: u64, compressed: u64) -> CompressionOutput {
        CompressionOutput {
            path: PathBuf::from("/tmp/x.mp4"),
            tier: QualityTier::Medium,
            geometry: None,
            original_size: original,
            compressed_size: compressed,
        }
    }

    #[test]
    fn reduction_percent() {
        assert_eq!(output(1000, 250).reduction_percent(), 75);
        assert_eq!(output(1000, 1000).reduction_percent(), 0);
        assert_eq!(output(1000, 1100).reduction_percent(), -10);
        assert_eq!(output(0, 10).reduction_percent(), 0);
    }

    #[test]
    fn result_job_id_and_terminality() {
        let id = Uuid::new_v4();
        let p = CompressResult::Progress { job_id: id, fraction: 0.5, message: "x".into() };
        assert_eq!(p.job_id(), id);
        assert!(!p.is_terminal());
        let e = CompressResult::Error { job_id: id, error: crate::error::CompressionError::Cancelled };
        assert!(e.is_terminal());
    }
}
