// crates/vidpress-media/src/lib.rs
//
// In-process FFmpeg compression pipeline. Callers talk to it through
// `compress` / `compress_with` (blocking) or `CompressWorker` (background
// jobs + result channel); everything else is internal plumbing.
//
// Module map:
//   probe          SourceAsset from a file path
//   output         temp output path + delete-unless-committed guard
//   demux          per-track reader threads (decode → bounded channel)
//   encode         destination container + per-track writers
//   pipeline       coordinator: state machine, events, progress, finalize
//   passthrough    stream-copy remux for the Original tier
//   worker         background job runner with per-job cancel tokens
//   testclip       synthesized clips for whole-pipeline tests (test only)

mod demux;
mod encode;
mod output;
mod passthrough;
mod pipeline;
pub mod probe;
pub mod worker;

#[cfg(test)]
mod testclip;

use std::sync::OnceLock;

use ffmpeg_the_third as ffmpeg;

pub use pipeline::{compress, compress_with};
pub use worker::{CompressJob, CompressWorker};
pub use vidpress_core::{
    CancelToken, CompressOptions, CompressResult, CompressionError, CompressionOutput,
    ProgressEvent, QualityTier,
};

/// Initialise FFmpeg once per process. Safe to call from any thread, any
/// number of times; later calls return the first call's outcome.
pub fn init() -> Result<(), CompressionError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| {
        ffmpeg::init().map_err(|e| format!("FFmpeg init failed: {e}"))?;
        // libav* logs straight to stderr; keep it to real errors.
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
        log::debug!("[media] ffmpeg initialised");
        Ok(())
    })
    .clone()
    .map_err(CompressionError::Unknown)
}
