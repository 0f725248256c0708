// crates/vidpress-media/src/pipeline.rs
//
// Coordinator for one compress() call.
//
// Threads per re-encode job:
//   caller thread     this module: state machine, event loop, finalize.
//   video reader      demux + decode, bounded channel to the video writer.
//   video writer      scale + H.264 encode + mux; emits progress events.
//   audio reader/writer pair, only when the source has audio.
//
// All progress callbacks run on the caller's thread, inside compress_with;
// worker threads only send PipelineEvents. The coordinator wakes at least
// every `poll_interval` so a cancel is noticed even when no events arrive.
//
// Failure handling:
//   The first TrackFailed (or a cancel) raises the internal halt flag. All
//   workers poll it between samples and exit; the coordinator joins them,
//   skips the trailer, and the OutputGuard deletes the partial file.

use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use vidpress_core::helpers::geometry::resolve;
use vidpress_core::helpers::time::format_file_size;
use vidpress_core::progress::{messages, ProgressReporter, ProgressThrottle};
use vidpress_core::state::{PipelineState, TrackState};
use vidpress_core::{
    CancelToken, CompressOptions, CompressionError, CompressionOutput, ProgressEvent, ProgressRange,
    QualityProfile, QualityTier, SourceAsset, TargetGeometry, TrackKind,
};

use crate::demux::{self, AudioReader, ReaderMsg, StopFlags, VideoReader};
use crate::encode::{self, AudioWriter, TrackWriter, VideoWriter};
use crate::output::OutputGuard;
use crate::{passthrough, probe};

// ── Public entry points ───────────────────────────────────────────────────────

/// Compress `source` at `tier` with default options and no way to cancel.
/// Blocking; run it on a worker thread if the caller has a UI to keep alive.
pub fn compress<F>(source: &Path, tier: QualityTier, on_progress: F) -> Result<CompressionOutput, CompressionError>
where
    F: FnMut(ProgressEvent),
{
    compress_with(source, tier, &CompressOptions::default(), &CancelToken::new(), on_progress)
}

/// Compress `source` at `tier`. Blocking.
///
/// `on_progress` is called on this thread with non-decreasing fractions; the
/// last call on success carries 1.0. On any error the temporary output is
/// removed before returning. Signalling `cancel` at any point before the
/// trailer is written makes this return `CompressionError::Cancelled`.
pub fn compress_with<F>(
    source:      &Path,
    tier:        QualityTier,
    opts:        &CompressOptions,
    cancel:      &CancelToken,
    on_progress: F,
) -> Result<CompressionOutput, CompressionError>
where
    F: FnMut(ProgressEvent),
{
    let opts = opts.clone().sanitized();
    let mut coord = Coordinator::new(ProgressReporter::new(on_progress), StopFlags::new(cancel.clone()), &opts);

    log::info!("[compress] {} tier={tier}", source.display());
    match run(&mut coord, source, tier) {
        Ok(output) => Ok(output),
        Err(e) => {
            let during = coord.state();
            let e = coord.fail(e);
            if e.is_cancelled() {
                log::info!("[compress] cancelled during {during:?}: {}", source.display());
            } else {
                log::error!("[compress] failed during {during:?} at {:.0}%: {e}", coord.last_progress() * 100.0);
            }
            Err(e)
        }
    }
}

fn run<F: FnMut(ProgressEvent)>(
    coord:  &mut Coordinator<F>,
    source: &Path,
    tier:   QualityTier,
) -> Result<CompressionOutput, CompressionError> {
    coord.report(0.0, messages::ANALYZING);
    coord.advance(PipelineState::Configuring)?;

    let asset = probe::probe_source(source)?;
    coord.check_cancel()?;

    let guard = OutputGuard::create(&coord.opts.temp_dir).map_err(|e| {
        CompressionError::EncoderConfigurationFailed(
            anyhow!(e).context(format!("create output in '{}'", coord.opts.temp_dir.display())),
        )
    })?;

    let geometry = match tier.profile() {
        None => {
            passthrough::run(coord, &asset, &guard)?;
            None
        }
        Some(profile) => Some(reencode(coord, &asset, &profile, &guard)?),
    };

    let path = guard
        .commit()
        .map_err(|e| CompressionError::EncodingFailed(anyhow!(e).context("move finished output into place")))?;
    coord.advance(PipelineState::Completed)?;

    let output = CompressionOutput {
        compressed_size: std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
        path,
        tier,
        geometry,
        original_size: asset.file_size,
    };
    log::info!(
        "[compress] {} → {} ({}% smaller) → {}",
        format_file_size(output.original_size),
        format_file_size(output.compressed_size),
        output.reduction_percent(),
        output.path.display(),
    );

    let done = if tier.is_passthrough() { messages::PASSTHROUGH_DONE } else { messages::COMPLETE };
    coord.report(1.0, done);
    Ok(output)
}

// ── Re-encode path ────────────────────────────────────────────────────────────

fn reencode<F: FnMut(ProgressEvent)>(
    coord:   &mut Coordinator<F>,
    asset:   &SourceAsset,
    profile: &QualityProfile,
    guard:   &OutputGuard,
) -> Result<TargetGeometry, CompressionError> {
    coord.report(0.1, messages::PREPARING);

    let geometry = resolve(asset.natural_size, &asset.transform, Some(profile.max_dimension));
    log::info!(
        "[compress] {}x{} (rot {}°) → {}x{} @ {} kb/s",
        asset.natural_size.width,
        asset.natural_size.height,
        asset.transform.rotation_degrees(),
        geometry.width,
        geometry.height,
        profile.video_bit_rate / 1000,
    );

    let dest = encode::open_destination(guard.part_path(), asset, geometry, profile, &coord.opts)
        .map_err(CompressionError::EncoderConfigurationFailed)?;
    coord.check_cancel()?;

    coord.advance(PipelineState::Running)?;
    coord.report(coord.opts.progress_range.start, messages::COMPRESSING);

    let (events_tx, events_rx) = unbounded();
    let mut workers = Workers::new(coord.stop.clone());
    let mut tracks = vec![TrackKind::Video];
    let depth = coord.opts.channel_depth;

    let spawned: anyhow::Result<()> = (|| {
        let (rx, h) = demux::spawn_reader(
            TrackKind::Video, depth, coord.stop.clone(),
            VideoReader::opener(asset.path.clone(), asset.start_secs),
        )?;
        workers.push(h);
        let (setup, output) = (dest.video, dest.output.clone());
        workers.push(spawn_writer(
            TrackKind::Video, rx, events_tx.clone(), coord.stop.clone(),
            move || VideoWriter::new(setup, output),
        )?);

        if let Some(setup) = dest.audio {
            let (rx, h) = demux::spawn_reader(
                TrackKind::Audio, depth, coord.stop.clone(),
                AudioReader::opener(asset.path.clone(), asset.start_secs),
            )?;
            workers.push(h);
            let output = dest.output.clone();
            workers.push(spawn_writer(
                TrackKind::Audio, rx, events_tx.clone(), coord.stop.clone(),
                move || AudioWriter::new(setup, output),
            )?);
            tracks.push(TrackKind::Audio);
        }
        Ok(())
    })();
    drop(events_tx);
    spawned.map_err(|e| CompressionError::Unknown(format!("{e:#}")))?;

    let outcome = coord.run_tracks(&events_rx, &tracks);
    if outcome.is_err() {
        coord.stop.halt.cancel();
    }
    workers.join_all();
    coord.check_cancel()?;
    outcome?;

    coord.advance(PipelineState::Finalizing)?;
    coord.report(coord.opts.progress_range.end, messages::FINALIZING);
    coord.check_cancel()?;

    encode::finish_destination(&dest.output).map_err(CompressionError::EncodingFailed)?;
    // Last handle to the Output: dropping it closes the file before rename.
    drop(dest.output);
    Ok(geometry)
}

// ── Events ────────────────────────────────────────────────────────────────────

/// What worker threads tell the coordinator.
pub(crate) enum PipelineEvent {
    /// Video track completion in [0, 1].
    Progress(f64),
    TrackFinished(TrackKind),
    TrackFailed(TrackKind, anyhow::Error),
}

/// Spawn a writer thread that pumps `rx` into the writer built by `make`.
/// `make` runs on the new thread so scalers and resamplers are born there.
pub(crate) fn spawn_writer<W, F>(
    kind:   TrackKind,
    rx:     Receiver<ReaderMsg<W::Sample>>,
    events: Sender<PipelineEvent>,
    stop:   StopFlags,
    make:   F,
) -> anyhow::Result<JoinHandle<()>>
where
    W: TrackWriter,
    F: FnOnce() -> W + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("vidpress-{}-writer", kind.label()))
        .spawn(move || {
            let mut writer = make();
            match pump(kind, &mut writer, &rx, &events, &stop) {
                Ok(true) => {
                    let _ = events.send(PipelineEvent::TrackFinished(kind));
                }
                Ok(false) => log::debug!("[pipeline] {} writer stopped", kind.label()),
                Err(e) => {
                    let _ = events.send(PipelineEvent::TrackFailed(kind, e));
                }
            }
        })
        .with_context(|| format!("spawn {} writer thread", kind.label()))
}

/// Returns `Ok(true)` once the track is fully written, `Ok(false)` when
/// stopped early by the stop flags.
fn pump<W: TrackWriter>(
    kind:   TrackKind,
    writer: &mut W,
    rx:     &Receiver<ReaderMsg<W::Sample>>,
    events: &Sender<PipelineEvent>,
    stop:   &StopFlags,
) -> anyhow::Result<bool> {
    loop {
        if stop.should_stop() {
            return Ok(false);
        }
        match rx.recv() {
            Ok(ReaderMsg::Sample(sample)) => {
                if let Some(local) = writer.append(sample)? {
                    let _ = events.send(PipelineEvent::Progress(local));
                }
            }
            Ok(ReaderMsg::EndOfStream) => {
                writer.finish()?;
                return Ok(true);
            }
            Ok(ReaderMsg::Failed(e)) => return Err(e.context(format!("{} reader", kind.label()))),
            Err(_) if stop.should_stop() => return Ok(false),
            Err(_) => return Err(anyhow!("{} reader exited without end of stream", kind.label())),
        }
    }
}

/// Joins every worker thread, on `join_all` or on drop. Dropping without
/// `join_all` raises the halt flag first so nothing is left running.
struct Workers {
    stop:    StopFlags,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    fn new(stop: StopFlags) -> Self {
        Self { stop, handles: Vec::new() }
    }

    fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    fn join_all(&mut self) {
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("[pipeline] {name} panicked");
            }
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.stop.halt.cancel();
            self.join_all();
        }
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

/// Per-call session state shared by the re-encode and passthrough paths.
pub(crate) struct Coordinator<F: FnMut(ProgressEvent)> {
    pub opts:     CompressOptions,
    pub stop:     StopFlags,
    pub throttle: ProgressThrottle,
    reporter:     ProgressReporter<F>,
    state:        PipelineState,
}

impl<F: FnMut(ProgressEvent)> Coordinator<F> {
    pub fn new(reporter: ProgressReporter<F>, stop: StopFlags, opts: &CompressOptions) -> Self {
        Self {
            throttle: ProgressThrottle::new(opts.progress_step),
            opts: opts.clone(),
            stop,
            reporter,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn report(&mut self, fraction: f64, message: impl Into<String>) {
        self.reporter.report(fraction, message);
    }

    /// Last fraction delivered to the caller.
    pub fn last_progress(&self) -> f64 {
        self.reporter.last()
    }

    pub fn poll_interval(&self) -> Duration {
        self.opts.poll_interval()
    }

    pub fn advance(&mut self, to: PipelineState) -> Result<(), CompressionError> {
        let from = self.state;
        self.state
            .advance(to)
            .map_err(|e| CompressionError::Unknown(e.to_string()))?;
        log::debug!("[pipeline] {from:?} → {to:?}");
        Ok(())
    }

    pub fn check_cancel(&self) -> Result<(), CompressionError> {
        if self.stop.cancel.is_cancelled() {
            Err(CompressionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Move to the terminal state matching `err` and stop all workers.
    pub fn fail(&mut self, err: CompressionError) -> CompressionError {
        self.stop.halt.cancel();
        let to = if err.is_cancelled() { PipelineState::Cancelled } else { PipelineState::Failed };
        if !self.state.is_terminal() {
            if let Err(e) = self.state.advance(to) {
                log::debug!("[pipeline] {e}");
            }
        }
        err
    }

    /// Run the event loop until every track in `tracks` has finished, one
    /// fails, or the caller cancels.
    pub fn run_tracks(&mut self, events: &Receiver<PipelineEvent>, tracks: &[TrackKind]) -> Result<(), CompressionError> {
        let mut pending: Vec<(TrackKind, TrackState)> =
            tracks.iter().map(|&k| (k, TrackState::Active)).collect();
        let range: ProgressRange = self.opts.progress_range;
        let poll = self.poll_interval();

        loop {
            if pending.iter().all(|(_, s)| *s == TrackState::Finished) {
                return Ok(());
            }
            self.check_cancel()?;

            match events.recv_timeout(poll) {
                Ok(PipelineEvent::Progress(local)) => {
                    if let Some(local) = self.throttle.offer(local) {
                        self.report(range.map(local), messages::compressing(local));
                    }
                }
                Ok(PipelineEvent::TrackFinished(kind)) => {
                    log::debug!("[pipeline] {} track finished", kind.label());
                    for (k, s) in pending.iter_mut() {
                        if *k == kind {
                            *s = TrackState::Finished;
                        }
                    }
                }
                Ok(PipelineEvent::TrackFailed(kind, e)) => {
                    self.stop.halt.cancel();
                    // A cancel that raced the failure still wins.
                    self.check_cancel()?;
                    return Err(CompressionError::EncodingFailed(e.context(format!("{} track", kind.label()))));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.check_cancel()?;
                    if pending.iter().all(|(_, s)| *s == TrackState::Finished) {
                        return Ok(());
                    }
                    return Err(CompressionError::Unknown("track workers exited without reporting".into()));
                }
            }
        }
    }
}
