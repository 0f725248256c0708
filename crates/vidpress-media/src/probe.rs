// crates/vidpress-media/src/probe.rs
//
// In-process FFmpeg probing: duration, start time, natural frame size,
// display transform, audio presence. Builds the SourceAsset every other
// stage reads from.

use std::path::Path;

use anyhow::anyhow;
use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::format::input;
use ffmpeg::format::stream::Stream;
use ffmpeg::media::Type;

use vidpress_core::{CompressionError, DisplayTransform, FrameSize, SourceAsset};

/// Open `path` and describe it. Fails with `SourceUnreadable` when the
/// container cannot be opened and `NoVideoTrack` when there is no usable
/// video stream (audio-only files, or a stream with zero dimensions).
pub fn probe_source(path: &Path) -> Result<SourceAsset, CompressionError> {
    crate::init()?;

    let ictx = input(path).map_err(|e| {
        log::warn!("[probe] open failed for {}: {e}", path.display());
        CompressionError::SourceUnreadable(anyhow!(e).context(format!("open '{}'", path.display())))
    })?;

    let stream = ictx.streams().best(Type::Video).ok_or(CompressionError::NoVideoTrack)?;

    let natural_size = unsafe {
        let p = stream.parameters().as_ptr();
        FrameSize::new((*p).width.max(0) as u32, (*p).height.max(0) as u32)
    };
    if natural_size.is_degenerate() {
        log::warn!("[probe] video stream has no dimensions in {}", path.display());
        return Err(CompressionError::NoVideoTrack);
    }

    let duration_secs = container_duration(&ictx).or_else(|| stream_duration(&stream)).unwrap_or(0.0);
    let start_secs = match ictx.start_time() {
        ffi::AV_NOPTS_VALUE => 0.0,
        t => t as f64 / ffi::AV_TIME_BASE as f64,
    };
    let transform = display_transform(&stream);
    let has_audio = ictx.streams().best(Type::Audio).is_some();
    let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    log::info!(
        "[probe] {}x{} rot={} {:.2}s audio={} ← {}",
        natural_size.width,
        natural_size.height,
        transform.rotation_degrees(),
        duration_secs,
        has_audio,
        path.display(),
    );

    Ok(SourceAsset {
        path: path.to_path_buf(),
        duration_secs,
        start_secs,
        natural_size,
        transform,
        has_audio,
        file_size,
    })
}

fn container_duration(ictx: &ffmpeg::format::context::Input) -> Option<f64> {
    let d = ictx.duration();
    (d > 0).then(|| d as f64 / ffi::AV_TIME_BASE as f64)
}

// Fall back to stream duration
fn stream_duration(stream: &Stream) -> Option<f64> {
    let d = stream.duration();
    if d <= 0 {
        return None;
    }
    let tb = stream.time_base();
    Some(d as f64 * tb.numerator() as f64 / tb.denominator().max(1) as f64)
}

/// Display matrix from the stream's coded side data, falling back to the
/// legacy `rotate` metadata tag some muxers still write.
fn display_transform(stream: &Stream) -> DisplayTransform {
    if let Some(matrix) = display_matrix(stream) {
        return DisplayTransform::from_display_matrix(&matrix);
    }
    stream
        .metadata()
        .get("rotate")
        .and_then(|r| r.trim().parse::<i32>().ok())
        .map(DisplayTransform::rotation)
        .unwrap_or(DisplayTransform::IDENTITY)
}

fn display_matrix(stream: &Stream) -> Option<[i32; 9]> {
    unsafe {
        let par = stream.parameters().as_ptr();
        let sd = ffi::av_packet_side_data_get(
            (*par).coded_side_data,
            (*par).nb_coded_side_data,
            ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
        );
        if sd.is_null() || (*sd).size < 9 * std::mem::size_of::<i32>() {
            return None;
        }
        let src = (*sd).data as *const i32;
        let mut matrix = [0i32; 9];
        for (i, cell) in matrix.iter_mut().enumerate() {
            *cell = src.add(i).read_unaligned();
        }
        Some(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_unreadable() {
        let err = probe_source(Path::new("/definitely/not/here.mov")).unwrap_err();
        assert!(matches!(err, CompressionError::SourceUnreadable(_)), "{err:?}");
    }

    #[test]
    fn garbage_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.mp4");
        std::fs::write(&path, b"this is not a video container").unwrap();
        let err = probe_source(&path).unwrap_err();
        assert!(matches!(err, CompressionError::SourceUnreadable(_)), "{err:?}");
    }
}
