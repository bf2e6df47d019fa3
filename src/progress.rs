#![forbid(unsafe_code)]

//! Translation of the downloader's native progress into the 0–100 scale
//! reported to pollers.
//!
//! The outer range is split into phases. yt-dlp only reports progress for
//! its own download step and goes silent while ffmpeg converts, so the
//! download is squeezed below 95 and the conversion gets a marker of its own
//! instead of the bar jumping straight to 100.

/// Metadata fetch and other pre-flight work.
pub const PREFLIGHT: u8 = 0;
/// First value the download phase can report.
pub const DOWNLOAD_START: u8 = 5;
/// Upper clamp for the download phase.
pub const DOWNLOAD_CEILING: u8 = 95;
/// Download finished, transcoding starts.
pub const TRANSCODE_START: u8 = 70;
/// Upper bound reserved for transcode reporting.
pub const TRANSCODE_END: u8 = 80;
pub const COMPLETE: u8 = 100;

/// `(native_from, native_to, outer_from, outer_to)`
const SEGMENTS: [(f64, f64, f64, f64); 3] = [
    (0.0, 25.0, 5.0, 30.0),
    (25.0, 75.0, 30.0, 70.0),
    (75.0, 100.0, 70.0, 95.0),
];

/// Maps a native download percentage onto the outer scale.
///
/// Each segment is interpolated linearly and floored. A finished download
/// (native 100 or more) maps to exactly [`TRANSCODE_START`].
pub fn map_download_progress(native: f64) -> u8 {
    if native.is_nan() || native <= 0.0 {
        return DOWNLOAD_START;
    }
    if native >= 100.0 {
        return TRANSCODE_START;
    }
    let (from, to, outer_from, outer_to) = SEGMENTS
        .iter()
        .copied()
        .find(|(from, to, _, _)| native >= *from && native < *to)
        .unwrap_or(SEGMENTS[2]);
    let outer = outer_from + (native - from) / (to - from) * (outer_to - outer_from);
    (outer.floor() as u8).clamp(DOWNLOAD_START, DOWNLOAD_CEILING)
}

/// Prefix of the progress template handed to yt-dlp.
pub const PROGRESS_MARKER: &str = "MCPROGRESS|";

/// Value passed to `--progress-template` so every progress line can be
/// parsed by [`parse_progress_line`].
pub const PROGRESS_TEMPLATE: &str = "download:MCPROGRESS|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress._percent_str)s";

/// Native download percentage carried by one templated progress line.
/// Byte counts win over the preformatted percent string.
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let stripped = line.trim().strip_prefix(PROGRESS_MARKER)?;
    let parts: Vec<&str> = stripped.split('|').collect();
    let downloaded = parse_number(parts.first().copied());
    let total = parse_number(parts.get(1).copied())
        .filter(|total| *total > 0.0)
        .or_else(|| parse_number(parts.get(2).copied()).filter(|total| *total > 0.0));

    if let (Some(done), Some(total)) = (downloaded, total) {
        return Some((done / total * 100.0).clamp(0.0, 100.0));
    }

    parts
        .get(3)
        .map(|raw| raw.trim().trim_end_matches('%').trim().to_string())
        .and_then(|raw| raw.parse::<f64>().ok())
        .map(|value| value.clamp(0.0, 100.0))
}

fn parse_number(raw: Option<&str>) -> Option<f64> {
    let raw = raw?.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("na") || raw.eq_ignore_ascii_case("none") {
        return None;
    }
    raw.parse::<f64>().ok()
}

/// Drops reports that would not move the outer percentage forward, so the
/// store is not rewritten for every progress line the tool prints.
#[derive(Debug, Default)]
pub struct ProgressThrottle {
    last: Option<u8>,
}

impl ProgressThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, percent: u8) -> Option<u8> {
        match self.last {
            Some(last) if percent <= last => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            }
        }
    }
}
