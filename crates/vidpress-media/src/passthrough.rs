// crates/vidpress-media/src/passthrough.rs
//
// Original tier: copy the best video and audio streams into a fresh MP4
// without decoding. Geometry, bitrate and display matrix all carry over
// untouched.
//
// The packet loop runs on its own thread and publishes how far it has got
// through an atomic; the coordinator polls that on its usual cadence, which
// is also where it notices a cancel. The trailer is written back on the
// coordinator thread after a final cancel check, same as the re-encode path.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use crossbeam_channel::{bounded, RecvTimeoutError};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::encoder;
use ffmpeg::format::context::{Input, Output};
use ffmpeg::format::{input as open_input, output as open_output};
use ffmpeg::media::Type as MediaType;
use ffmpeg::util::rational::Rational;

use vidpress_core::progress::messages;
use vidpress_core::state::PipelineState;
use vidpress_core::{CompressionError, ProgressEvent, SourceAsset};

use crate::demux::StopFlags;
use crate::output::OutputGuard;
use crate::pipeline::Coordinator;

pub(crate) fn run<F: FnMut(ProgressEvent)>(
    coord: &mut Coordinator<F>,
    asset: &SourceAsset,
    guard: &OutputGuard,
) -> Result<(), CompressionError> {
    coord.report(0.1, messages::PREPARING_ORIGINAL);

    let remux = Remux::open(asset, guard.part_path(), coord.opts.faststart)
        .map_err(CompressionError::EncoderConfigurationFailed)?;
    coord.check_cancel()?;

    let range = coord.opts.progress_range;
    coord.advance(PipelineState::Running)?;
    coord.report(range.start, messages::EXPORTING_ORIGINAL);

    let progress = Arc::new(AtomicU64::new(0f64.to_bits()));
    let (done_tx, done_rx) = bounded(1);
    let handle = {
        let progress = progress.clone();
        let stop = coord.stop.clone();
        std::thread::Builder::new()
            .name("vidpress-remux".into())
            .spawn(move || {
                let mut remux = remux;
                let copied = remux.copy_packets(&stop, &progress);
                let _ = done_tx.send(copied.map(|completed| (remux, completed)));
            })
            .map_err(|e| CompressionError::Unknown(format!("spawn remux thread: {e}")))?
    };

    let poll = coord.poll_interval();
    let result = loop {
        match done_rx.recv_timeout(poll) {
            Ok(result) => break result,
            Err(RecvTimeoutError::Timeout) => {
                let local = f64::from_bits(progress.load(Ordering::Relaxed));
                if let Some(local) = coord.throttle.offer(local) {
                    coord.report(range.map(local), messages::exporting(local));
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                break Err(anyhow!("remux thread exited without reporting"));
            }
        }
    };
    if handle.join().is_err() {
        log::error!("[passthrough] remux thread panicked");
    }

    coord.check_cancel()?;
    let (mut remux, completed) = result.map_err(CompressionError::EncodingFailed)?;
    if !completed {
        return Err(CompressionError::Unknown("remux stopped without a cancel".into()));
    }

    coord.advance(PipelineState::Finalizing)?;
    coord.report(range.end, messages::FINALIZING);
    coord.check_cancel()?;

    remux.octx.write_trailer().context("write trailer").map_err(CompressionError::EncodingFailed)?;
    log::debug!("[passthrough] {} packets copied", remux.packets);
    Ok(())
}

/// Where packets of one input stream go.
#[derive(Clone, Copy)]
struct Route {
    out_idx: usize,
    in_tb:   Rational,
    out_tb:  Rational,
}

struct Remux {
    ictx:          Input,
    octx:          Output,
    /// Indexed by input stream index.
    routes:        Vec<Option<Route>>,
    video_idx:     usize,
    origin_secs:   f64,
    duration_secs: f64,
    packets:       u64,
}

impl Remux {
    /// Open both containers, mirror the chosen streams, write the header.
    fn open(asset: &SourceAsset, dest: &Path, faststart: bool) -> anyhow::Result<Self> {
        let ictx = open_input(&asset.path)
            .with_context(|| format!("open '{}'", asset.path.display()))?;
        let mut octx = open_output(dest)
            .with_context(|| format!("could not open output '{}'", dest.display()))?;

        let video_idx = ictx
            .streams()
            .best(MediaType::Video)
            .ok_or_else(|| anyhow!("no video stream in '{}'", asset.path.display()))?
            .index();
        let audio_idx = ictx.streams().best(MediaType::Audio).map(|s| s.index());

        let mut routes: Vec<Option<Route>> = vec![None; ictx.nb_streams() as usize];
        for in_idx in std::iter::once(video_idx).chain(audio_idx) {
            let ist = ictx
                .stream(in_idx)
                .ok_or_else(|| anyhow!("input stream {in_idx} missing"))?;
            let mut ost = octx
                .add_stream(encoder::find(ist.parameters().id()))
                .with_context(|| format!("add output stream for input {in_idx}"))?;
            ost.set_parameters(ist.parameters());
            let out_idx = ost.index();
            // The source tag may name a different container's fourcc.
            unsafe {
                (*(**(*octx.as_mut_ptr()).streams.add(out_idx)).codecpar).codec_tag = 0;
            }
            routes[in_idx] = Some(Route { out_idx, in_tb: ist.time_base(), out_tb: Rational::new(0, 1) });
        }

        if log::log_enabled!(log::Level::Debug) {
            ffmpeg::format::context::output::dump(&octx, 0, Some(&dest.to_string_lossy()));
        }
        let mut header_opts = ffmpeg::Dictionary::new();
        if faststart {
            header_opts.set("movflags", "+faststart");
        }
        octx.write_header_with(header_opts).context("write output header")?;

        for route in routes.iter_mut().flatten() {
            route.out_tb = octx
                .stream(route.out_idx)
                .map(|s| s.time_base())
                .ok_or_else(|| anyhow!("output stream {} missing", route.out_idx))?;
        }

        log::info!(
            "[passthrough] copying {} stream(s) → {}",
            routes.iter().flatten().count(),
            dest.display(),
        );

        Ok(Self {
            ictx,
            octx,
            routes,
            video_idx,
            origin_secs: asset.start_secs,
            duration_secs: asset.duration_secs,
            packets: 0,
        })
    }

    /// Copy every routed packet. Returns `Ok(false)` when stopped early.
    /// Video timestamps drive `progress` (stored as f64 bits, 0..=1).
    fn copy_packets(&mut self, stop: &StopFlags, progress: &AtomicU64) -> anyhow::Result<bool> {
        for result in self.ictx.packets() {
            if stop.should_stop() {
                return Ok(false);
            }
            let (stream, mut packet) = result.context("read packet")?;
            let in_idx = stream.index();
            let Some(route) = self.routes.get(in_idx).copied().flatten() else {
                continue;
            };

            if in_idx == self.video_idx && self.duration_secs > 0.0 {
                if let Some(pts) = packet.pts() {
                    let secs = pts as f64 * f64::from(route.in_tb) - self.origin_secs;
                    let local = (secs / self.duration_secs).clamp(0.0, 1.0);
                    progress.fetch_max(local.to_bits(), Ordering::Relaxed);
                }
            }

            packet.set_stream(route.out_idx);
            packet.rescale_ts(route.in_tb, route.out_tb);
            packet.set_position(-1);
            packet
                .write_interleaved(&mut self.octx)
                .with_context(|| format!("write packet for stream {}", route.out_idx))?;
            self.packets += 1;
        }
        progress.store(1f64.to_bits(), Ordering::Relaxed);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::compress_with;
    use crate::testclip::{self, Clip};
    use vidpress_core::{CancelToken, CompressOptions, FrameSize, ProgressRange, QualityTier};

    #[test]
    fn progress_bits_order_like_fractions() {
        // fetch_max on the raw bits is only valid for non-negative floats.
        let xs = [0.0f64, 0.01, 0.25, 0.5, 0.999, 1.0];
        for w in xs.windows(2) {
            assert!(w[0].to_bits() < w[1].to_bits());
        }
    }

    #[test]
    fn original_tier_copies_streams_inside_the_caller_range() {
        if !testclip::encoders_available() {
            eprintln!("mpeg4/aac/h264 encoders missing, skipping");
            return;
        }
        let src = tempfile::tempdir().unwrap();
        let source = src.path().join("source.mp4");
        testclip::write_clip(&source, &Clip::video(640, 360).with_audio(16_000)).unwrap();
        let out = tempfile::tempdir().unwrap();
        let opts = CompressOptions {
            temp_dir: out.path().to_path_buf(),
            progress_range: ProgressRange::new(0.3, 0.6),
            ..CompressOptions::default()
        };

        let mut seen = Vec::new();
        let output = compress_with(&source, QualityTier::Original, &opts, &CancelToken::new(), |e| seen.push(e))
            .unwrap();

        assert_eq!(output.geometry, None);
        let asset = crate::probe::probe_source(&output.path).unwrap();
        assert_eq!(asset.natural_size, FrameSize::new(640, 360));
        assert!(asset.has_audio);

        let exporting: Vec<_> = seen.iter().filter(|e| e.message.starts_with("Exporting")).collect();
        assert!(!exporting.is_empty());
        assert!((exporting[0].fraction - 0.3).abs() < 1e-9);
        assert!(exporting.iter().all(|e| (0.3 - 1e-9..=0.6 + 1e-9).contains(&e.fraction)));

        let finalizing = seen.iter().find(|e| e.message == messages::FINALIZING).unwrap();
        assert!((finalizing.fraction - 0.6).abs() < 1e-9);
        let last = seen.last().unwrap();
        assert_eq!(last.message, messages::PASSTHROUGH_DONE);
        assert_eq!(last.fraction, 1.0);
        assert!(seen.windows(2).all(|w| w[0].fraction <= w[1].fraction));
    }
}
