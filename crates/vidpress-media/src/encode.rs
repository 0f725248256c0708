// crates/vidpress-media/src/encode.rs
//
// Destination container and per-track writers for the re-encode path.
//
// Stream layout in the output MP4:
//   Stream 0: H.264 video (YUV420P, average bitrate from the tier, GOP ≤ 30)
//   Stream 1: AAC audio (FLTP stereo, 44.1 kHz by default), only when the
//             source has an audio track
//
// Orientation:
//   Pixels are encoded in the source's native orientation at the target size
//   mapped back through the display transform. The source display matrix is
//   copied onto stream 0 so players rotate on playback, exactly as they did
//   for the source.
//
// PTS strategy:
//   Video: source timestamps rebased on the container start, kept in the
//   source stream's own time base. A frame that would not advance the clock
//   is nudged forward one tick so the encoder always sees strictly
//   increasing PTS.
//   Audio: a sample counter in 1/rate, seeded from the first audio frame's
//   rebased start so any A/V offset in the source is preserved.
//
// Audio buffering:
//   Every output frame from swr is sized with swr_get_out_samples, so an
//   upsampling resampler never parks samples inside swr between calls. The
//   resulting stereo FLTP PCM is queued per channel and cut into
//   `encoder.frame_size()` frames (1024 for AAC). At end of stream swr is
//   flushed, the queue's tail is zero-padded to one last frame, and the
//   encoder is drained.
//
// Threading:
//   The Output lives behind a parking_lot::Mutex shared by both writers; a
//   writer holds the lock only while handing one encoded packet to the
//   interleaver. Encoders are created here on the coordinator thread and
//   moved into their writer threads; scalers and resamplers are created
//   lazily on the writer thread that uses them.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _};
use parking_lot::Mutex;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::context::Output;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{input as open_input, output as open_output, Pixel, Sample};
use ffmpeg::media::Type as MediaType;
use ffmpeg::software::resampling;
use ffmpeg::software::scaling::{Context as ScaleCtx, Flags as ScaleFlags};
use ffmpeg::util::channel_layout::{ChannelLayout, ChannelLayoutMask};
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use vidpress_core::{CompressOptions, DisplayTransform, FrameSize, QualityProfile, SourceAsset, TargetGeometry};

use crate::demux::{AudioSample, VideoSample};

pub(crate) type SharedOutput = Arc<Mutex<Output>>;

const VIDEO_STREAM: usize = 0;
const AUDIO_STREAM: usize = 1;

// ── Writer contract ───────────────────────────────────────────────────────────

/// Sink side of one track: encodes samples and hands packets to the muxer.
pub(crate) trait TrackWriter {
    type Sample: Send + 'static;

    /// Encode one sample. Returns this track's completion in [0, 1] when the
    /// track drives progress (video does, audio does not).
    fn append(&mut self, sample: Self::Sample) -> anyhow::Result<Option<f64>>;

    /// Flush everything still buffered once the reader reports end of stream.
    fn finish(&mut self) -> anyhow::Result<()>;
}

// ── Destination ───────────────────────────────────────────────────────────────

/// A configured output container with its header written, plus the opened
/// encoders waiting to be moved into writer threads.
pub(crate) struct Destination {
    pub output: SharedOutput,
    pub video:  VideoWriterSetup,
    pub audio:  Option<AudioWriterSetup>,
}

pub(crate) struct VideoWriterSetup {
    encoder:       encoder::Video,
    src_size:      FrameSize,
    dst_size:      FrameSize,
    enc_tb:        Rational,
    ost_tb:        Rational,
    duration_secs: f64,
}

pub(crate) struct AudioWriterSetup {
    encoder:    encoder::Audio,
    rate:       u32,
    frame_size: usize,
    ost_tb:     Rational,
}

/// Build the output container at `path`: add and open both encoders, attach
/// the display matrix, write the header. Any error here means the settings
/// were rejected; nothing has been encoded yet.
pub(crate) fn open_destination(
    path:     &Path,
    source:   &SourceAsset,
    geometry: TargetGeometry,
    profile:  &QualityProfile,
    opts:     &CompressOptions,
) -> anyhow::Result<Destination> {
    let (src_tb, frame_rate) = source_video_timing(&source.path)?;

    let mut octx = open_output(path)
        .with_context(|| format!("could not open output '{}'", path.display()))?;
    let global_header = octx
        .format()
        .flags()
        .contains(ffmpeg::format::flag::Flags::GLOBAL_HEADER);

    // ── Video encoder (stream 0) ──────────────────────────────────────────────
    let dst_size = geometry.native_for(&source.transform);
    // The configured encoder when it exists and is H.264, else any H.264 encoder.
    let h264 = encoder::find_by_name(&opts.video_encoder)
        .filter(|c| c.id() == CodecId::H264)
        .or_else(|| {
            log::debug!("[encode] '{}' unavailable, using default H.264 encoder", opts.video_encoder);
            encoder::find(CodecId::H264)
        })
        .ok_or_else(|| anyhow!("H.264 encoder not found (is libx264 available?)"))?;

    let mut ost_video = octx.add_stream(h264).context("add video stream")?;
    ost_video.set_time_base(src_tb);

    let mut video_enc = codec::context::Context::new_with_codec(h264)
        .encoder()
        .video()
        .context("create video encoder context")?;
    video_enc.set_width(dst_size.width);
    video_enc.set_height(dst_size.height);
    video_enc.set_format(Pixel::YUV420P);
    video_enc.set_time_base(src_tb);
    video_enc.set_frame_rate(Some(frame_rate));
    video_enc.set_bit_rate(profile.video_bit_rate as usize);
    video_enc.set_gop(opts.max_keyframe_interval);
    if global_header {
        video_enc.set_flags(codec::flag::Flags::GLOBAL_HEADER);
    }

    let mut x264_opts = ffmpeg::Dictionary::new();
    x264_opts.set("preset", "fast");
    x264_opts.set("profile", "high");

    let mut video_encoder = video_enc
        .open_as_with(h264, x264_opts)
        .with_context(|| format!("open {} at {}x{}", h264.name(), dst_size.width, dst_size.height))?;
    // libavcodec resets SAR during open; set it on the opened context so
    // avcodec_parameters_from_context picks it up.
    video_encoder.set_aspect_ratio(Rational::new(1, 1));

    copy_encoder_parameters(&mut octx, VIDEO_STREAM, video_encoder.as_ptr())?;
    if !source.transform.is_identity() {
        attach_display_matrix(&mut octx, VIDEO_STREAM, &source.transform)?;
    }

    // ── Audio encoder (stream 1, optional) ────────────────────────────────────
    let audio = if source.has_audio {
        Some(add_audio_stream(&mut octx, profile, opts, global_header)?)
    } else {
        None
    };

    // ── Header ────────────────────────────────────────────────────────────────
    if log::log_enabled!(log::Level::Debug) {
        ffmpeg::format::context::output::dump(&octx, 0, Some(&path.to_string_lossy()));
    }
    let mut header_opts = ffmpeg::Dictionary::new();
    if opts.faststart {
        header_opts.set("movflags", "+faststart");
    }
    octx.write_header_with(header_opts).context("write output header")?;

    // The muxer may pick its own stream time bases during write_header.
    let ost_video_tb = stream_time_base(&octx, VIDEO_STREAM)?;
    let audio = match audio {
        Some((encoder, rate, frame_size)) => Some(AudioWriterSetup {
            encoder,
            rate,
            frame_size,
            ost_tb: stream_time_base(&octx, AUDIO_STREAM)?,
        }),
        None => None,
    };

    log::info!(
        "[encode] {} {}x{} @ {} kb/s, gop {}, audio {}",
        h264.name(),
        dst_size.width,
        dst_size.height,
        profile.video_bit_rate / 1000,
        opts.max_keyframe_interval,
        if audio.is_some() { "aac" } else { "none" },
    );

    Ok(Destination {
        output: Arc::new(Mutex::new(octx)),
        video: VideoWriterSetup {
            encoder: video_encoder,
            src_size: source.natural_size,
            dst_size,
            enc_tb: src_tb,
            ost_tb: ost_video_tb,
            duration_secs: source.duration_secs,
        },
        audio,
    })
}

fn add_audio_stream(
    octx:          &mut Output,
    profile:       &QualityProfile,
    opts:          &CompressOptions,
    global_header: bool,
) -> anyhow::Result<(encoder::Audio, u32, usize)> {
    let rate = opts.audio_sample_rate;
    let audio_tb = Rational::new(1, rate as i32);

    let aac = encoder::find(CodecId::AAC).ok_or_else(|| anyhow!("AAC encoder not found"))?;

    let mut ost_audio = octx.add_stream(aac).context("add audio stream")?;
    ost_audio.set_time_base(audio_tb);

    let mut audio_enc = codec::context::Context::new_with_codec(aac)
        .encoder()
        .audio()
        .context("create audio encoder context")?;
    audio_enc.set_rate(rate as i32);
    audio_enc.set_ch_layout(ChannelLayout::STEREO);
    audio_enc.set_format(Sample::F32(SampleType::Planar));
    audio_enc.set_bit_rate(profile.audio_bit_rate as usize);
    audio_enc.set_time_base(audio_tb);
    if global_header {
        audio_enc.set_flags(codec::flag::Flags::GLOBAL_HEADER);
    }

    let audio_encoder = audio_enc
        .open_as_with(aac, ffmpeg::Dictionary::new())
        .context("open AAC encoder")?;
    // AAC reports 1024; guard against an encoder that reports 0.
    let frame_size = (audio_encoder.frame_size() as usize).max(1024);

    copy_encoder_parameters(octx, AUDIO_STREAM, audio_encoder.as_ptr())?;
    Ok((audio_encoder, rate, frame_size))
}

/// Source video stream time base and average frame rate.
fn source_video_timing(path: &Path) -> anyhow::Result<(Rational, Rational)> {
    let ictx = open_input(path).with_context(|| format!("open '{}'", path.display()))?;
    let stream = ictx
        .streams()
        .best(MediaType::Video)
        .ok_or_else(|| anyhow!("no video stream in '{}'", path.display()))?;
    let tb = stream.time_base();
    let rate = [stream.avg_frame_rate(), stream.rate()]
        .into_iter()
        .find(|r| r.numerator() > 0 && r.denominator() > 0)
        .unwrap_or(Rational::new(30, 1));
    if tb.numerator() <= 0 || tb.denominator() <= 0 {
        return Ok((rate.invert(), rate));
    }
    Ok((tb, rate))
}

fn stream_time_base(octx: &Output, idx: usize) -> anyhow::Result<Rational> {
    octx.stream(idx)
        .map(|s| s.time_base())
        .ok_or_else(|| anyhow!("output stream {idx} missing"))
}

/// Copy encoder params into the stream's codecpar so the muxer has
/// resolution, format and extradata. encoder::Video does not implement
/// AsPtr<AVCodecParameters>, so this goes through FFI.
pub(crate) fn copy_encoder_parameters(
    octx: &mut Output,
    idx:  usize,
    enc:  *const ffmpeg::ffi::AVCodecContext,
) -> anyhow::Result<()> {
    let ret = unsafe {
        ffmpeg::ffi::avcodec_parameters_from_context(
            (**(*octx.as_mut_ptr()).streams.add(idx)).codecpar,
            enc as *mut ffmpeg::ffi::AVCodecContext,
        )
    };
    if ret < 0 {
        bail!("avcodec_parameters_from_context (stream {idx}) failed: {}", ffmpeg::Error::from(ret));
    }
    Ok(())
}

/// Attach `transform` as an AV_PKT_DATA_DISPLAYMATRIX entry on the stream's
/// coded side data. Must run after `copy_encoder_parameters`, which
/// replaces the codecpar side data wholesale.
pub(crate) fn attach_display_matrix(octx: &mut Output, idx: usize, transform: &DisplayTransform) -> anyhow::Result<()> {
    let matrix = transform.to_display_matrix();
    let size = std::mem::size_of_val(&matrix);
    unsafe {
        let par = (**(*octx.as_mut_ptr()).streams.add(idx)).codecpar;
        let sd = ffmpeg::ffi::av_packet_side_data_new(
            &mut (*par).coded_side_data,
            &mut (*par).nb_coded_side_data,
            ffmpeg::ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
            size,
            0,
        );
        if sd.is_null() {
            bail!("could not allocate display matrix side data");
        }
        std::ptr::copy_nonoverlapping(matrix.as_ptr() as *const u8, (*sd).data, size);
    }
    log::debug!("[encode] display matrix attached (rotation {}°)", transform.rotation_degrees());
    Ok(())
}

/// Write the container trailer. Called once, after both writers finished.
pub(crate) fn finish_destination(output: &SharedOutput) -> anyhow::Result<()> {
    output.lock().write_trailer().context("write trailer")
}

// ── Video writer ──────────────────────────────────────────────────────────────

pub(crate) struct VideoWriter {
    setup:    VideoWriterSetup,
    output:   SharedOutput,
    /// Created on the first frame, once the decoded pixel format is known.
    scaler:   Option<ScaleCtx>,
    last_pts: Option<i64>,
    frames:   u64,
}

impl VideoWriter {
    pub fn new(setup: VideoWriterSetup, output: SharedOutput) -> Self {
        Self { setup, output, scaler: None, last_pts: None, frames: 0 }
    }

    fn drain_packets(&mut self) -> anyhow::Result<()> {
        let mut pkt = Packet::empty();
        while self.setup.encoder.receive_packet(&mut pkt).is_ok() {
            pkt.set_stream(VIDEO_STREAM);
            pkt.rescale_ts(self.setup.enc_tb, self.setup.ost_tb);
            pkt.write_interleaved(&mut self.output.lock())
                .context("write video packet")?;
        }
        Ok(())
    }
}

/// `pts_secs` in ticks of `tb`, nudged past `last` when it would not advance.
fn monotonic_pts(last: &mut Option<i64>, pts_secs: f64, tb: Rational) -> i64 {
    let wanted = (pts_secs.max(0.0) / f64::from(tb)).round() as i64;
    let pts = match *last {
        Some(prev) if wanted <= prev => prev + 1,
        _ => wanted,
    };
    *last = Some(pts);
    pts
}

impl TrackWriter for VideoWriter {
    type Sample = VideoSample;

    fn append(&mut self, sample: VideoSample) -> anyhow::Result<Option<f64>> {
        let VideoSample { frame, pts_secs } = sample;

        if self.scaler.is_none() {
            let src = self.setup.src_size;
            let dst = self.setup.dst_size;
            self.scaler = Some(
                ScaleCtx::get(
                    frame.format(), src.width, src.height,
                    Pixel::YUV420P, dst.width, dst.height,
                    ScaleFlags::BILINEAR,
                )
                .context("create swscale context")?,
            );
        }
        let Some(scaler) = self.scaler.as_mut() else {
            bail!("swscale context missing");
        };

        let mut yuv = VideoFrame::empty();
        scaler.run(&frame, &mut yuv).context("scale video frame")?;

        let pts = monotonic_pts(&mut self.last_pts, pts_secs, self.setup.enc_tb);
        yuv.set_pts(Some(pts));
        // Let the encoder place keyframes; the GOP cap does the rest.
        yuv.set_kind(ffmpeg::picture::Type::None);
        // swscale carries the source SAR onto the output frame. No safe
        // setter exists in ffmpeg-the-third 4.
        unsafe {
            (*yuv.as_mut_ptr()).sample_aspect_ratio = ffmpeg::ffi::AVRational { num: 1, den: 1 };
        }

        self.setup.encoder.send_frame(&yuv).context("send video frame to encoder")?;
        self.drain_packets()?;
        self.frames += 1;

        if self.setup.duration_secs <= 0.0 {
            return Ok(None);
        }
        Ok(Some((pts_secs / self.setup.duration_secs).clamp(0.0, 1.0)))
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.setup.encoder.send_eof().context("send EOF to video encoder")?;
        self.drain_packets()?;
        log::debug!("[encode] video flushed after {} frames", self.frames);
        Ok(())
    }
}

// ── Audio buffering ───────────────────────────────────────────────────────────

/// Stereo FLTP samples waiting to be cut into encoder-sized frames.
struct AudioFifo {
    /// `[left, right]`, always the same length.
    planes: [Vec<f32>; 2],
}

impl AudioFifo {
    fn new() -> Self {
        Self { planes: [Vec::new(), Vec::new()] }
    }

    fn len(&self) -> usize {
        self.planes[0].len()
    }

    /// Queue an F32 planar frame. A single-plane frame feeds both channels.
    fn push(&mut self, frame: &AudioFrame) {
        if frame.samples() == 0 || frame.planes() == 0 {
            return;
        }
        let last = frame.planes() - 1;
        for (ch, queue) in self.planes.iter_mut().enumerate() {
            queue.extend_from_slice(frame.plane::<f32>(ch.min(last)));
        }
    }

    /// Cut the next `n` samples into a frame stamped `pts`. Missing samples
    /// at the end of the stream read as silence.
    fn take(&mut self, n: usize, rate: u32, pts: i64) -> AudioFrame {
        let mut frame = AudioFrame::new(Sample::F32(SampleType::Planar), n, ChannelLayoutMask::STEREO);
        frame.set_rate(rate);
        frame.set_pts(Some(pts));

        let have = self.len().min(n);
        for (ch, queue) in self.planes.iter_mut().enumerate() {
            let samples = queue.drain(..have).chain(std::iter::repeat(0.0));
            for (dst, v) in frame.plane_mut::<f32>(ch).iter_mut().zip(samples) {
                *dst = v;
            }
        }
        frame
    }
}

/// Run `input` through `rs` into `fifo`. `None` flushes whatever swr still
/// holds. Output frames are sized by swr itself so nothing is left behind.
fn resample_into(
    rs:    &mut resampling::Context,
    input: Option<&AudioFrame>,
    rate:  u32,
    fifo:  &mut AudioFifo,
) -> anyhow::Result<()> {
    let in_samples = input.map_or(0, |f| f.samples()) as i32;
    loop {
        let capacity = unsafe { ffmpeg::ffi::swr_get_out_samples(rs.as_mut_ptr(), in_samples) };
        if capacity < 0 {
            bail!("swr_get_out_samples failed: {}", ffmpeg::Error::from(capacity));
        }
        if capacity == 0 {
            return Ok(());
        }

        let mut out = AudioFrame::new(Sample::F32(SampleType::Planar), capacity as usize, ChannelLayoutMask::STEREO);
        out.set_rate(rate);
        match input {
            Some(frame) => rs.run(frame, &mut out).map(|_| ()).context("resample audio frame")?,
            None => rs.flush(&mut out).map(|_| ()).context("flush audio resampler")?,
        }
        let produced = out.samples();
        fifo.push(&out);

        // One call consumes a whole input frame; flushing repeats until dry.
        if input.is_some() || produced == 0 {
            return Ok(());
        }
    }
}

// ── Audio writer ──────────────────────────────────────────────────────────────

pub(crate) struct AudioWriter {
    setup:          AudioWriterSetup,
    output:         SharedOutput,
    /// Created on the first frame that is not already stereo FLTP at the
    /// output rate.
    resampler:      Option<resampling::Context>,
    fifo:           AudioFifo,
    /// PTS of the next encoder frame in samples; seeded by the first input frame.
    next_pts:       Option<i64>,
}

impl AudioWriter {
    pub fn new(setup: AudioWriterSetup, output: SharedOutput) -> Self {
        Self { setup, output, resampler: None, fifo: AudioFifo::new(), next_pts: None }
    }

    /// Feed the encoder every whole frame in the queue, and the zero-padded
    /// remainder too when `flush` is set.
    fn encode_queued(&mut self, flush: bool) -> anyhow::Result<()> {
        let n = self.setup.frame_size;
        while self.fifo.len() >= n || (flush && self.fifo.len() > 0) {
            let pts = self.next_pts.unwrap_or(0);
            let frame = self.fifo.take(n, self.setup.rate, pts);
            self.next_pts = Some(pts + n as i64);

            self.setup.encoder.send_frame(&frame).context("send audio frame to encoder")?;
            self.write_packets()?;
        }
        Ok(())
    }

    fn write_packets(&mut self) -> anyhow::Result<()> {
        let audio_tb = Rational::new(1, self.setup.rate as i32);
        let mut pkt = Packet::empty();
        while self.setup.encoder.receive_packet(&mut pkt).is_ok() {
            pkt.set_stream(AUDIO_STREAM);
            pkt.rescale_ts(audio_tb, self.setup.ost_tb);
            pkt.write_interleaved(&mut self.output.lock())
                .context("write audio packet")?;
        }
        Ok(())
    }
}

impl TrackWriter for AudioWriter {
    type Sample = AudioSample;

    fn append(&mut self, sample: AudioSample) -> anyhow::Result<Option<f64>> {
        let AudioSample { frame: raw, pts_secs } = sample;
        let rate = self.setup.rate;

        if self.next_pts.is_none() {
            self.next_pts = Some((pts_secs.max(0.0) * rate as f64).round() as i64);
        }

        let target_fmt = Sample::F32(SampleType::Planar);
        let passes_through = self.resampler.is_none()
            && raw.format() == target_fmt
            && raw.rate() == rate
            && raw.ch_layout().channels() == 2;

        if passes_through {
            self.fifo.push(&raw);
        } else {
            if self.resampler.is_none() {
                // Mono sources must be declared MONO or swr misreads the layout.
                let src_layout = if raw.ch_layout().channels() >= 2 {
                    raw.ch_layout()
                } else {
                    ChannelLayout::MONO
                };
                let rs = resampling::Context::get2(
                    raw.format(), src_layout, raw.rate(),
                    target_fmt, ChannelLayout::STEREO, rate,
                )
                .context("create audio resampler")?;
                self.resampler = Some(rs);
            }
            if let Some(rs) = self.resampler.as_mut() {
                resample_into(rs, Some(&raw), rate, &mut self.fifo)?;
            }
        }

        self.encode_queued(false)?;
        Ok(None)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(rs) = self.resampler.as_mut() {
            resample_into(rs, None, self.setup.rate, &mut self.fifo)?;
        }
        self.encode_queued(true)?;
        self.setup.encoder.send_eof().context("send EOF to audio encoder")?;
        self.write_packets()?;
        log::debug!("[encode] audio flushed at sample {}", self.next_pts.unwrap_or(0));
        Ok(())
    }
}
