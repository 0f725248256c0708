// crates/vidpress-core/src/progress.rs
//
// Progress reporting for one compress() call.
//
// Fractions reaching the caller are always in [0, 1] and never go backwards
// within a session. Track-level progress (video PTS / duration) is mapped
// into a sub-range of the overall scale and throttled so the sink only sees
// meaningful movement.

use serde::{Deserialize, Serialize};

/// One progress update delivered to the caller's sink.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub fraction: f64,
    pub message:  String,
}

impl ProgressEvent {
    pub fn new(fraction: f64, message: impl Into<String>) -> Self {
        Self { fraction: fraction.clamp(0.0, 1.0), message: message.into() }
    }
}

/// Linear sub-range of the overall progress scale.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressRange {
    pub start: f64,
    pub end:   f64,
}

impl ProgressRange {
    pub const FULL: Self = Self { start: 0.0, end: 1.0 };

    pub fn new(start: f64, end: f64) -> Self {
        let start = start.clamp(0.0, 1.0);
        Self { start, end: end.clamp(start, 1.0) }
    }

    /// Map a local fraction in [0, 1] into this range.
    pub fn map(&self, local: f64) -> f64 {
        self.start + local.clamp(0.0, 1.0) * (self.end - self.start)
    }
}

/// Forwards events to a sink while enforcing the session ordering rule.
///
/// Any event whose fraction is below the last one delivered is raised to it,
/// so the sequence seen by the caller is non-decreasing.
pub struct ProgressReporter<F: FnMut(ProgressEvent)> {
    sink:  F,
    range: ProgressRange,
    last:  f64,
}

impl<F: FnMut(ProgressEvent)> ProgressReporter<F> {
    pub fn new(sink: F) -> Self {
        Self::with_range(sink, ProgressRange::FULL)
    }

    /// Every fraction passed to `report` is first mapped through `range`.
    /// Used when compress() is one stage of a larger job (e.g. 0–50% before upload).
    pub fn with_range(sink: F, range: ProgressRange) -> Self {
        Self { sink, range, last: 0.0 }
    }

    pub fn report(&mut self, fraction: f64, message: impl Into<String>) {
        let mapped = self.range.map(fraction).max(self.last);
        self.last = mapped;
        (self.sink)(ProgressEvent::new(mapped, message));
    }

    pub fn last(&self) -> f64 {
        self.last
    }
}

/// Decides when track-level progress is worth reporting.
///
/// Tracks the last *emitted* local fraction and only lets a new value through
/// once it has moved forward by at least `step`.
#[derive(Clone, Debug)]
pub struct ProgressThrottle {
    step: f64,
    last: f64,
}

impl ProgressThrottle {
    pub fn new(step: f64) -> Self {
        Self { step: step.max(0.0), last: 0.0 }
    }

    /// Returns `Some(local)` when `local` should be reported.
    pub fn offer(&mut self, local: f64) -> Option<f64> {
        let local = local.clamp(0.0, 1.0);
        if local - self.last >= self.step && local > self.last {
            self.last = local;
            Some(local)
        } else {
            None
        }
    }

    pub fn last(&self) -> f64 {
        self.last
    }
}

/// Human-readable status strings, kept in one place so the UI layer can map
/// them to localized text.
pub mod messages {
    pub const ANALYZING:          &str = "Analyzing video...";
    pub const PREPARING:          &str = "Preparing compression...";
    pub const COMPRESSING:        &str = "Compressing video...";
    pub const FINALIZING:         &str = "Finalizing...";
    pub const COMPLETE:           &str = "Compression complete!";
    pub const PREPARING_ORIGINAL: &str = "Preparing original quality...";
    pub const EXPORTING_ORIGINAL: &str = "Exporting original...";
    pub const PASSTHROUGH_DONE:   &str = "Complete!";

    pub fn compressing(local: f64) -> String {
        format!("Compressing: {}%", (local * 100.0) as u32)
    }

    pub fn exporting(local: f64) -> String {
        format!("Exporting: {}%", (local * 100.0) as u32)
    }
}
