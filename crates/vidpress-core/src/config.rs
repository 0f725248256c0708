// crates/vidpress-core/src/config.rs
//
// Tunables for the compression pipeline.
//
// Every field has a default matching the behaviour users expect from the
// mobile client, so `CompressOptions::default()` is the normal path and a
// JSON file only needs to name the fields it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::progress::ProgressRange;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressOptions {
    /// Directory for the temporary output file. Defaults to the OS temp dir.
    pub temp_dir:              PathBuf,
    /// Portion of the overall scale covered by the sample pump (re-encode) or
    /// the remux copy loop (passthrough).
    pub progress_range:        ProgressRange,
    /// Minimum forward movement of track progress before the sink is called.
    pub progress_step:         f64,
    /// Bounded channel depth between each reader and its writer.
    pub channel_depth:         usize,
    /// Coordinator wake-up cadence for cancellation checks and passthrough polling.
    pub poll_interval_ms:      u64,
    /// H.264 GOP cap in frames.
    pub max_keyframe_interval: u32,
    /// AAC output sample rate.
    pub audio_sample_rate:     u32,
    /// Move the moov atom to the front so the file streams on upload.
    pub faststart:             bool,
    /// Preferred H.264 encoder by name; any H.264 encoder is used as fallback.
    pub video_encoder:         String,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            temp_dir:              std::env::temp_dir(),
            progress_range:        ProgressRange::new(0.2, 0.9),
            progress_step:         0.05,
            channel_depth:         2,
            poll_interval_ms:      100,
            max_keyframe_interval: 30,
            audio_sample_rate:     44_100,
            faststart:             true,
            video_encoder:         "libx264".into(),
        }
    }
}

impl CompressOptions {
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let opts: Self = serde_json::from_str(text).context("parse compress options")?;
        Ok(opts.sanitized())
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config '{}'", path.display()))?;
        Self::from_json_str(&text)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Clamp values that would deadlock or divide by zero further down.
    pub fn sanitized(mut self) -> Self {
        self.channel_depth         = self.channel_depth.clamp(1, 64);
        self.poll_interval_ms      = self.poll_interval_ms.clamp(10, 5_000);
        self.max_keyframe_interval = self.max_keyframe_interval.clamp(1, 30);
        self.progress_step         = self.progress_step.clamp(0.0, 1.0);
        self.progress_range        = ProgressRange::new(self.progress_range.start, self.progress_range.end);
        if self.audio_sample_rate == 0 {
            self.audio_sample_rate = 44_100;
        }
        self
    }
}
