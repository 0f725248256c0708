// crates/vidpress-core/src/helpers/time.rs
//
// Human-readable durations and byte counts for log lines and status text.

/// Short clock-style duration for log lines and the CLI: `H:MM:SS` from an
/// hour up, `M:SS` from a minute up, otherwise tenths of a second.
///
/// ```
/// use vidpress_core::helpers::time::format_duration;
/// assert_eq!(format_duration(4.2),    "4.2s");
/// assert_eq!(format_duration(187.0),  "3:07");
/// assert_eq!(format_duration(3875.0), "1:04:35");
/// ```
pub fn format_duration(secs: f64) -> String {
    let secs = secs.max(0.0);
    if secs < 60.0 {
        return format!("{secs:.1}s");
    }
    let whole = secs as u64;
    let (h, m, s) = (whole / 3600, whole / 60 % 60, whole % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

/// Format a byte count with decimal (file-manager style) units.
///
/// ```
/// use vidpress_core::helpers::time::format_file_size;
/// assert_eq!(format_file_size(999),           "999 bytes");
/// assert_eq!(format_file_size(1_500),         "1.5 KB");
/// assert_eq!(format_file_size(12_345_678),    "12.3 MB");
/// assert_eq!(format_file_size(2_000_000_000), "2.0 GB");
/// ```
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1_000 {
        return format!("{bytes} bytes");
    }
    let mut value = bytes as f64 / 1_000.0;
    let mut unit = 0;
    while value >= 1_000.0 && unit + 1 < UNITS.len() {
        value /= 1_000.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_duration_clamps() {
        assert_eq!(format_duration(-3.0), "0.0s");
    }

    #[test]
    fn size_boundaries() {
        assert_eq!(format_file_size(0), "0 bytes");
        assert_eq!(format_file_size(1_000), "1.0 KB");
        assert_eq!(format_file_size(1_000_000), "1.0 MB");
    }
}
