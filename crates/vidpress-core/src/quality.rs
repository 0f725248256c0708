// crates/vidpress-core/src/quality.rs
//
// Quality tiers and their static encode profiles.
//
// Low / Medium / High re-encode to H.264 + AAC with the bitrates and size cap
// below. Original never re-encodes: it routes to the passthrough remux, so it
// has no profile at all rather than a bitrate nobody reads.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    #[default]
    Medium,
    High,
    Original,
}

/// Encoder settings for one re-encoding tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QualityProfile {
    /// Average video bitrate, bits/s.
    pub video_bit_rate: u32,
    /// AAC bitrate, bits/s.
    pub audio_bit_rate: u32,
    /// Cap on the longest side of the output frame, pixels.
    pub max_dimension:  u32,
}

const LOW: QualityProfile = QualityProfile {
    video_bit_rate: 1_000_000,
    audio_bit_rate: 64_000,
    max_dimension:  720,
};

const MEDIUM: QualityProfile = QualityProfile {
    video_bit_rate: 2_500_000,
    audio_bit_rate: 128_000,
    max_dimension:  1080,
};

const HIGH: QualityProfile = QualityProfile {
    video_bit_rate: 5_000_000,
    audio_bit_rate: 192_000,
    max_dimension:  1920,
};

impl QualityTier {
    pub const ALL: [QualityTier; 4] = [
        QualityTier::Low,
        QualityTier::Medium,
        QualityTier::High,
        QualityTier::Original,
    ];

    /// Re-encode settings, or `None` for the passthrough tier.
    pub fn profile(self) -> Option<QualityProfile> {
        match self {
            QualityTier::Low      => Some(LOW),
            QualityTier::Medium   => Some(MEDIUM),
            QualityTier::High     => Some(HIGH),
            QualityTier::Original => None,
        }
    }

    pub fn is_passthrough(self) -> bool {
        self.profile().is_none()
    }

    /// Longest-side cap in pixels; `None` is unbounded.
    pub fn max_dimension(self) -> Option<u32> {
        self.profile().map(|p| p.max_dimension)
    }

    /// Rough output size as a percentage of the input, shown before the user
    /// commits to a tier. Deliberately coarse; bitrate caps dominate.
    pub fn size_percent(self) -> u64 {
        match self {
            QualityTier::Low      => 30,
            QualityTier::Medium   => 50,
            QualityTier::High     => 70,
            QualityTier::Original => 100,
        }
    }

    /// Estimated output size in bytes for a source of `source_bytes`.
    pub fn estimated_size(self, source_bytes: u64) -> u64 {
        source_bytes.saturating_mul(self.size_percent()) / 100
    }

    pub fn label(self) -> &'static str {
        match self {
            QualityTier::Low      => "Low",
            QualityTier::Medium   => "Medium",
            QualityTier::High     => "High",
            QualityTier::Original => "Original",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            QualityTier::Low      => "Smallest file size, good for sharing over slow connections",
            QualityTier::Medium   => "Balanced size and quality (recommended)",
            QualityTier::High     => "Best quality, larger file size",
            QualityTier::Original => "No compression, preserves original quality",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label().to_ascii_lowercase())
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low"      => Ok(QualityTier::Low),
            "medium"   => Ok(QualityTier::Medium),
            "high"     => Ok(QualityTier::High),
            "original" => Ok(QualityTier::Original),
            other      => Err(format!("unknown quality tier '{other}' (expected low, medium, high or original)")),
        }
    }
}
