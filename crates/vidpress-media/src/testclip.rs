// crates/vidpress-media/src/testclip.rs
//
// Small synthesized MP4 clips (MPEG-4 Part 2 video, optional AAC mono) so
// tests can drive the whole pipeline without checked-in media.

use std::path::Path;

use anyhow::{anyhow, Context as _};
use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::context::Output;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{input as open_input, output as open_output, Pixel, Sample};
use ffmpeg::media::Type as MediaType;
use ffmpeg::util::channel_layout::{ChannelLayout, ChannelLayoutMask};
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use vidpress_core::DisplayTransform;

use crate::encode::{attach_display_matrix, copy_encoder_parameters};

#[derive(Clone, Copy, Debug)]
pub(crate) struct Clip {
    pub width:      u32,
    pub height:     u32,
    pub fps:        i32,
    pub frames:     u32,
    pub audio_rate: Option<u32>,
    pub rotation:   i32,
}

impl Clip {
    /// 64 frames at 25 fps (2.56 s), video only. With 16 kHz audio that is
    /// exactly 40 AAC frames, so the source itself has no padded tail.
    pub fn video(width: u32, height: u32) -> Self {
        Self { width, height, fps: 25, frames: 64, audio_rate: None, rotation: 0 }
    }

    pub fn with_audio(mut self, rate: u32) -> Self {
        self.audio_rate = Some(rate);
        self
    }

    pub fn rotated(mut self, degrees: i32) -> Self {
        self.rotation = degrees;
        self
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames as f64 / self.fps as f64
    }
}

/// True when every encoder the end-to-end tests need is compiled into the
/// linked FFmpeg. Tests skip themselves otherwise.
pub(crate) fn encoders_available() -> bool {
    crate::init().is_ok()
        && encoder::find(CodecId::MPEG4).is_some()
        && encoder::find(CodecId::AAC).is_some()
        && encoder::find(CodecId::H264).is_some()
}

struct Track {
    encoder: encoder::Encoder,
    index:   usize,
    enc_tb:  Rational,
    ost_tb:  Rational,
}

impl Track {
    fn drain(&mut self, octx: &mut Output) -> anyhow::Result<()> {
        let mut pkt = Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            pkt.set_stream(self.index);
            pkt.rescale_ts(self.enc_tb, self.ost_tb);
            pkt.write_interleaved(octx).context("write packet")?;
        }
        Ok(())
    }

    fn finish(&mut self, octx: &mut Output) -> anyhow::Result<()> {
        self.encoder.send_eof().context("send EOF")?;
        self.drain(octx)
    }
}

/// Encode `clip` into `path`. The picture is a moving luma ramp and the
/// audio a 440 Hz sine, so neither encoder sees degenerate input.
pub(crate) fn write_clip(path: &Path, clip: &Clip) -> anyhow::Result<()> {
    crate::init()?;
    let mut octx = open_output(path).with_context(|| format!("open '{}'", path.display()))?;
    let global_header = octx.format().flags().contains(ffmpeg::format::flag::Flags::GLOBAL_HEADER);

    let video_tb = Rational::new(1, clip.fps);
    let mpeg4 = encoder::find(CodecId::MPEG4).ok_or_else(|| anyhow!("mpeg4 encoder missing"))?;
    octx.add_stream(mpeg4)?.set_time_base(video_tb);
    let mut video_enc = codec::context::Context::new_with_codec(mpeg4).encoder().video()?;
    video_enc.set_width(clip.width);
    video_enc.set_height(clip.height);
    video_enc.set_format(Pixel::YUV420P);
    video_enc.set_time_base(video_tb);
    video_enc.set_frame_rate(Some(Rational::new(clip.fps, 1)));
    video_enc.set_bit_rate(800_000);
    if global_header {
        video_enc.set_flags(codec::flag::Flags::GLOBAL_HEADER);
    }
    let video_enc = video_enc.open_as_with(mpeg4, ffmpeg::Dictionary::new())?;
    copy_encoder_parameters(&mut octx, 0, video_enc.as_ptr())?;
    if clip.rotation != 0 {
        attach_display_matrix(&mut octx, 0, &DisplayTransform::rotation(clip.rotation))?;
    }

    let mut audio = None;
    if let Some(rate) = clip.audio_rate {
        let audio_tb = Rational::new(1, rate as i32);
        let aac = encoder::find(CodecId::AAC).ok_or_else(|| anyhow!("aac encoder missing"))?;
        octx.add_stream(aac)?.set_time_base(audio_tb);
        let mut audio_enc = codec::context::Context::new_with_codec(aac).encoder().audio()?;
        audio_enc.set_rate(rate as i32);
        audio_enc.set_ch_layout(ChannelLayout::MONO);
        audio_enc.set_format(Sample::F32(SampleType::Planar));
        audio_enc.set_bit_rate(64_000);
        audio_enc.set_time_base(audio_tb);
        if global_header {
            audio_enc.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }
        let audio_enc = audio_enc.open_as_with(aac, ffmpeg::Dictionary::new())?;
        copy_encoder_parameters(&mut octx, 1, audio_enc.as_ptr())?;
        let frame_size = (audio_enc.frame_size() as usize).max(1024);
        audio = Some((audio_enc, rate, frame_size));
    }

    octx.write_header().context("write header")?;

    let time_base = |octx: &Output, idx: usize| {
        octx.stream(idx).map(|s| s.time_base()).ok_or_else(|| anyhow!("stream {idx} missing"))
    };
    let mut video = Track { encoder: video_enc.0.0, index: 0, enc_tb: video_tb, ost_tb: time_base(&octx, 0)? };
    let mut audio = match audio {
        Some((enc, rate, frame_size)) => Some((
            Track { encoder: enc.0.0, index: 1, enc_tb: Rational::new(1, rate as i32), ost_tb: time_base(&octx, 1)? },
            rate,
            frame_size,
        )),
        None => None,
    };

    let mut samples_written = 0usize;
    for i in 0..clip.frames {
        let mut frame = VideoFrame::new(Pixel::YUV420P, clip.width, clip.height);
        let stride = frame.stride(0);
        let luma = frame.data_mut(0);
        for y in 0..clip.height as usize {
            for x in 0..clip.width as usize {
                luma[y * stride + x] = ((x + y + i as usize * 4) % 256) as u8;
            }
        }
        frame.data_mut(1).fill(128);
        frame.data_mut(2).fill(128);
        frame.set_pts(Some(i64::from(i)));
        video.encoder.send_frame(&frame).context("send video frame")?;
        video.drain(&mut octx)?;

        if let Some((track, rate, frame_size)) = audio.as_mut() {
            let due = (u64::from(i) + 1) * u64::from(*rate) / clip.fps as u64;
            while (samples_written as u64) < due {
                let mut frame = AudioFrame::new(Sample::F32(SampleType::Planar), *frame_size, ChannelLayoutMask::MONO);
                frame.set_rate(*rate);
                frame.set_pts(Some(samples_written as i64));
                let step = 2.0 * std::f32::consts::PI * 440.0 / *rate as f32;
                for (n, v) in frame.plane_mut::<f32>(0).iter_mut().enumerate() {
                    *v = ((samples_written + n) as f32 * step).sin() * 0.3;
                }
                track.encoder.send_frame(&frame).context("send audio frame")?;
                track.drain(&mut octx)?;
                samples_written += *frame_size;
            }
        }
    }

    video.finish(&mut octx)?;
    if let Some((track, ..)) = audio.as_mut() {
        track.finish(&mut octx)?;
    }
    octx.write_trailer().context("write trailer")?;
    Ok(())
}

/// Media type and duration of every stream in a finished file.
pub(crate) fn stream_durations(path: &Path) -> anyhow::Result<Vec<(MediaType, f64)>> {
    let ictx = open_input(path).with_context(|| format!("open '{}'", path.display()))?;
    Ok(ictx
        .streams()
        .map(|s| {
            let medium = s.parameters().medium();
            (medium, s.duration() as f64 * f64::from(s.time_base()))
        })
        .collect())
}
