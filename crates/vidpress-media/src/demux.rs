// crates/vidpress-media/src/demux.rs
//
// Per-track readers.
//
// Each track (video, optionally audio) gets its own demuxer context and
// decoder, opened on the reader thread itself, and hands decoded frames to
// its writer over a bounded channel. The channel depth is the backpressure:
// a reader blocks on `send` once its writer falls `channel_depth` samples
// behind, so memory use stays flat regardless of file length.
//
// Shutdown:
//   A reader stops when its decoder hits EOF (sends EndOfStream), when it
//   fails (sends Failed), when the stop flags are raised, or when the writer
//   has dropped its receiver. No path blocks forever: a reader stuck in
//   `send` is released as soon as the writer exits and drops the receiver.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context as _};
use crossbeam_channel::{bounded, Receiver, Sender};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec;
use ffmpeg::format::context::Input;
use ffmpeg::format::input as open_input;
use ffmpeg::media::Type as MediaType;
use ffmpeg::util::error::EAGAIN;
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use vidpress_core::{CancelToken, TrackKind};

// ── Messages ──────────────────────────────────────────────────────────────────

/// What a reader hands its writer.
pub(crate) enum ReaderMsg<S> {
    Sample(S),
    EndOfStream,
    Failed(anyhow::Error),
}

/// One decoded video frame plus its presentation time, seconds since the
/// container start.
pub(crate) struct VideoSample {
    pub frame:    VideoFrame,
    pub pts_secs: f64,
}

/// One decoded audio frame plus its presentation time, seconds since the
/// container start.
pub(crate) struct AudioSample {
    pub frame:    AudioFrame,
    pub pts_secs: f64,
}

// ── Stop flags ────────────────────────────────────────────────────────────────

/// Caller cancellation plus the coordinator's internal halt (raised on the
/// first track failure). Every worker loop polls `should_stop` between samples.
#[derive(Clone, Default)]
pub(crate) struct StopFlags {
    pub cancel: CancelToken,
    pub halt:   CancelToken,
}

impl StopFlags {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel, halt: CancelToken::new() }
    }

    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.halt.is_cancelled()
    }
}

// ── Reader contract ───────────────────────────────────────────────────────────

/// Pull-style sample source for one track.
pub(crate) trait TrackReader {
    type Sample: Send + 'static;

    /// Next decoded sample, or `None` at end of stream.
    fn next_sample(&mut self) -> anyhow::Result<Option<Self::Sample>>;
}

/// Spawn a reader thread. `open` runs on that thread, so ffmpeg contexts
/// never cross a thread boundary after creation.
pub(crate) fn spawn_reader<R, F>(
    kind:  TrackKind,
    depth: usize,
    stop:  StopFlags,
    open:  F,
) -> anyhow::Result<(Receiver<ReaderMsg<R::Sample>>, JoinHandle<()>)>
where
    R: TrackReader,
    F: FnOnce() -> anyhow::Result<R> + Send + 'static,
{
    let (tx, rx) = bounded(depth.max(1));
    let handle = std::thread::Builder::new()
        .name(format!("vidpress-{}-reader", kind.label()))
        .spawn(move || match open() {
            Ok(reader) => read_loop(kind, reader, tx, stop),
            Err(e) => {
                let _ = tx.send(ReaderMsg::Failed(e));
            }
        })
        .with_context(|| format!("spawn {} reader thread", kind.label()))?;
    Ok((rx, handle))
}

fn read_loop<R: TrackReader>(
    kind:       TrackKind,
    mut reader: R,
    tx:         Sender<ReaderMsg<R::Sample>>,
    stop:       StopFlags,
) {
    let mut count: u64 = 0;
    loop {
        if stop.should_stop() {
            log::debug!("[demux] {} reader stopped after {count} samples", kind.label());
            return;
        }
        match reader.next_sample() {
            Ok(Some(sample)) => {
                count += 1;
                if tx.send(ReaderMsg::Sample(sample)).is_err() {
                    // Writer is gone; whoever dropped it reports why.
                    return;
                }
            }
            Ok(None) => {
                log::debug!("[demux] {} end of stream after {count} samples", kind.label());
                let _ = tx.send(ReaderMsg::EndOfStream);
                return;
            }
            Err(e) => {
                log::warn!("[demux] {} reader failed: {e:#}", kind.label());
                let _ = tx.send(ReaderMsg::Failed(e));
                return;
            }
        }
    }
}

// ── Packet source ─────────────────────────────────────────────────────────────

/// Demuxer filtered to one stream.
struct PacketSource {
    ictx:       Input,
    stream_idx: usize,
    time_base:  Rational,
    /// Container start, in stream time base units.
    origin:     i64,
}

impl PacketSource {
    fn open(path: &Path, kind: TrackKind, start_secs: f64) -> anyhow::Result<Self> {
        let ictx = open_input(path).with_context(|| format!("open '{}'", path.display()))?;
        let media = match kind {
            TrackKind::Video => MediaType::Video,
            TrackKind::Audio => MediaType::Audio,
        };
        let (stream_idx, time_base) = {
            let stream = ictx
                .streams()
                .best(media)
                .ok_or_else(|| anyhow!("no {} stream in '{}'", kind.label(), path.display()))?;
            (stream.index(), stream.time_base())
        };
        let origin = (start_secs / f64::from(time_base)).round() as i64;
        Ok(Self { ictx, stream_idx, time_base, origin })
    }

    fn decoder_context(&self) -> anyhow::Result<codec::context::Context> {
        let stream = self
            .ictx
            .stream(self.stream_idx)
            .ok_or_else(|| anyhow!("stream {} vanished", self.stream_idx))?;
        codec::context::Context::from_parameters(stream.parameters()).context("decoder context")
    }

    /// Next packet of our stream, or `None` at end of file.
    fn next_packet(&mut self) -> anyhow::Result<Option<Packet>> {
        loop {
            let mut packet = Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) if packet.stream() == self.stream_idx => return Ok(Some(packet)),
                Ok(()) => continue,
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(e) => return Err(anyhow!(e).context("read packet")),
            }
        }
    }

    /// Seconds since the container start for a timestamp in stream units.
    fn secs(&self, ts: i64) -> f64 {
        (ts - self.origin) as f64 * f64::from(self.time_base)
    }
}

/// Result of one `receive_frame` attempt.
enum Pull {
    Frame,
    NeedInput,
    Drained,
}

fn classify(result: Result<(), ffmpeg::Error>, what: &str) -> anyhow::Result<Pull> {
    match result {
        Ok(()) => Ok(Pull::Frame),
        Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(Pull::NeedInput),
        Err(ffmpeg::Error::Eof) => Ok(Pull::Drained),
        Err(e) => Err(anyhow!(e).context(format!("decode {what} frame"))),
    }
}

// ── Video ─────────────────────────────────────────────────────────────────────

pub(crate) struct VideoReader {
    source:   PacketSource,
    decoder:  ffmpeg::decoder::Video,
    draining: bool,
}

impl VideoReader {
    pub fn open(path: &Path, start_secs: f64) -> anyhow::Result<Self> {
        let source = PacketSource::open(path, TrackKind::Video, start_secs)?;
        let decoder = source
            .decoder_context()?
            .decoder()
            .video()
            .context("open video decoder")?;
        Ok(Self { source, decoder, draining: false })
    }

    pub fn opener(path: PathBuf, start_secs: f64) -> impl FnOnce() -> anyhow::Result<Self> + Send + 'static {
        move || Self::open(&path, start_secs)
    }
}

impl TrackReader for VideoReader {
    type Sample = VideoSample;

    fn next_sample(&mut self) -> anyhow::Result<Option<VideoSample>> {
        loop {
            let mut frame = VideoFrame::empty();
            match classify(self.decoder.receive_frame(&mut frame), "video")? {
                Pull::Frame => {
                    let ts = frame.pts().or(frame.timestamp()).unwrap_or(self.source.origin);
                    let pts_secs = self.source.secs(ts);
                    return Ok(Some(VideoSample { frame, pts_secs }));
                }
                Pull::Drained => return Ok(None),
                Pull::NeedInput if self.draining => return Ok(None),
                Pull::NeedInput => {}
            }
            match self.source.next_packet()? {
                Some(packet) => self.decoder.send_packet(&packet).context("send video packet to decoder")?,
                None => {
                    self.decoder.send_eof().context("send EOF to video decoder")?;
                    self.draining = true;
                }
            }
        }
    }
}

// ── Audio ─────────────────────────────────────────────────────────────────────

pub(crate) struct AudioReader {
    source:   PacketSource,
    decoder:  ffmpeg::decoder::Audio,
    draining: bool,
    skipped:  u64,
}

impl AudioReader {
    pub fn open(path: &Path, start_secs: f64) -> anyhow::Result<Self> {
        let source = PacketSource::open(path, TrackKind::Audio, start_secs)?;
        let decoder = source
            .decoder_context()?
            .decoder()
            .audio()
            .context("open audio decoder")?;
        Ok(Self { source, decoder, draining: false, skipped: 0 })
    }

    pub fn opener(path: PathBuf, start_secs: f64) -> impl FnOnce() -> anyhow::Result<Self> + Send + 'static {
        move || Self::open(&path, start_secs)
    }
}

impl TrackReader for AudioReader {
    type Sample = AudioSample;

    fn next_sample(&mut self) -> anyhow::Result<Option<AudioSample>> {
        loop {
            let mut frame = AudioFrame::empty();
            match classify(self.decoder.receive_frame(&mut frame), "audio")? {
                Pull::Frame => {
                    let ts = frame.pts().or(frame.timestamp()).unwrap_or(self.source.origin);
                    let pts_secs = self.source.secs(ts);
                    return Ok(Some(AudioSample { frame, pts_secs }));
                }
                Pull::Drained => return Ok(None),
                Pull::NeedInput if self.draining => return Ok(None),
                Pull::NeedInput => {}
            }
            match self.source.next_packet()? {
                Some(packet) => {
                    // A single undecodable audio packet costs a few ms of
                    // sound; it is not worth failing the whole job over.
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        self.skipped += 1;
                        log::warn!("[demux] skipping bad audio packet ({} so far): {e}", self.skipped);
                    }
                }
                None => {
                    self.decoder.send_eof().context("send EOF to audio decoder")?;
                    self.draining = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted reader: yields the queued results, then end of stream.
    struct Scripted(VecDeque<anyhow::Result<u32>>);

    impl TrackReader for Scripted {
        type Sample = u32;
        fn next_sample(&mut self) -> anyhow::Result<Option<u32>> {
            self.0.pop_front().transpose()
        }
    }

    fn scripted(items: Vec<anyhow::Result<u32>>) -> impl FnOnce() -> anyhow::Result<Scripted> + Send {
        // anyhow::Error is Send, so the script can move into the thread.
        move || Ok(Scripted(items.into()))
    }

    fn collect(rx: Receiver<ReaderMsg<u32>>) -> (Vec<u32>, Option<String>, bool) {
        let mut samples = Vec::new();
        let mut failure = None;
        let mut eos = false;
        for msg in rx {
            match msg {
                ReaderMsg::Sample(s) => samples.push(s),
                ReaderMsg::EndOfStream => eos = true,
                ReaderMsg::Failed(e) => failure = Some(e.to_string()),
            }
        }
        (samples, failure, eos)
    }

    #[test]
    fn delivers_in_order_then_end_of_stream() {
        let (rx, h) = spawn_reader(TrackKind::Video, 1, StopFlags::default(),
            scripted(vec![Ok(1), Ok(2), Ok(3)])).unwrap();
        let (samples, failure, eos) = collect(rx);
        h.join().unwrap();
        assert_eq!(samples, vec![1, 2, 3]);
        assert!(failure.is_none());
        assert!(eos);
    }

    #[test]
    fn failure_ends_the_stream_without_eos() {
        let (rx, h) = spawn_reader(TrackKind::Audio, 2, StopFlags::default(),
            scripted(vec![Ok(1), Err(anyhow!("corrupt packet")), Ok(3)])).unwrap();
        let (samples, failure, eos) = collect(rx);
        h.join().unwrap();
        assert_eq!(samples, vec![1]);
        assert_eq!(failure.as_deref(), Some("corrupt packet"));
        assert!(!eos);
    }

    #[test]
    fn open_failure_is_reported() {
        let (rx, h) = spawn_reader::<Scripted, _>(TrackKind::Video, 1, StopFlags::default(),
            || Err(anyhow!("no such file"))).unwrap();
        let (samples, failure, _) = collect(rx);
        h.join().unwrap();
        assert!(samples.is_empty());
        assert_eq!(failure.as_deref(), Some("no such file"));
    }

    #[test]
    fn bounded_channel_applies_backpressure() {
        let (rx, h) = spawn_reader(TrackKind::Video, 2, StopFlags::default(),
            scripted((0..100).map(Ok).collect())).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        // Reader cannot run ahead of the channel depth.
        assert!(rx.len() <= 2);
        let (samples, _, eos) = collect(rx);
        h.join().unwrap();
        assert_eq!(samples.len(), 100);
        assert!(eos);
    }

    #[test]
    fn stop_flag_halts_reader_and_dropped_receiver_releases_it() {
        let stop = StopFlags::default();
        let (rx, h) = spawn_reader(TrackKind::Video, 1, stop.clone(),
            scripted((0..1_000).map(Ok).collect())).unwrap();
        assert!(matches!(rx.recv().unwrap(), ReaderMsg::Sample(0)));
        stop.halt.cancel();
        drop(rx);
        h.join().unwrap();
    }

    #[test]
    fn missing_file_fails_to_open() {
        assert!(VideoReader::open(Path::new("/nope/missing.mp4"), 0.0).is_err());
    }
}
