#![forbid(unsafe_code)]

//! Wraps the external downloader and transcoder behind one blocking call
//! that reports normalized `(percent, message)` progress.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::RuntimeSettings;
use crate::error::{ConvertError, Result};
use crate::identifier::JobKey;
use crate::process::run_streaming;
use crate::profile::{Profile, TargetFormat};
use crate::progress::{
    DOWNLOAD_START, PREFLIGHT, PROGRESS_TEMPLATE, ProgressThrottle, TRANSCODE_END,
    TRANSCODE_START, map_download_progress, parse_progress_line,
};
use crate::transcode::Transcoder;

const TITLE_MARKER: &str = "MCTITLE|";
const OUTPUT_MARKER: &str = "MCOUTPUT|";

/// Progress in the fallback transcode, between the download marker and the
/// end of the reserved transcode range.
const FALLBACK_TRANSCODE: u8 = (TRANSCODE_START + TRANSCODE_END) / 2;

#[derive(Debug, Clone)]
pub enum ConvertSource {
    Url(String),
    Upload {
        path: PathBuf,
        original_name: String,
    },
}

impl ConvertSource {
    /// Human-readable description kept in the job status.
    pub fn describe(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Upload { original_name, .. } => original_name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub key: JobKey,
    pub source: ConvertSource,
    /// Scratch directory owned by the caller; the output lands inside it.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertOutput {
    pub path: PathBuf,
    pub title: String,
}

/// Runs one conversion to completion. Blocking; callers move it off the
/// async runtime.
pub trait Converter: Send + Sync {
    fn convert(
        &self,
        request: &ConvertRequest,
        progress: &dyn Fn(u8, &str),
    ) -> Result<ConvertOutput>;
}

/// yt-dlp for URLs, ffmpeg for uploads and for anything yt-dlp could not
/// finish converting itself.
#[derive(Debug, Clone)]
pub struct ToolConverter {
    ytdlp_bin: PathBuf,
    timeout: Duration,
    audio_quality: String,
    transcoder: Transcoder,
}

impl ToolConverter {
    pub fn new(settings: &RuntimeSettings) -> Self {
        Self {
            ytdlp_bin: settings.ytdlp_bin.clone(),
            timeout: settings.tool_timeout,
            audio_quality: settings.audio_quality.clone(),
            transcoder: Transcoder::new(
                settings.ffmpeg_bin.clone(),
                settings.tool_timeout,
                &settings.audio_quality,
            ),
        }
    }

    fn convert_url(
        &self,
        request: &ConvertRequest,
        url: &str,
        progress: &dyn Fn(u8, &str),
    ) -> Result<ConvertOutput> {
        let profile = request.key.profile;
        let format = profile.format();
        progress(PREFLIGHT, "Fetching video information");

        let command = self.download_command(profile, url, &request.work_dir);
        let mut title: Option<String> = None;
        let mut reported_output: Option<PathBuf> = None;
        let mut throttle = ProgressThrottle::new();
        let mut download_finished = false;

        let run = run_streaming(command, "yt-dlp", self.timeout, |line| {
            if let Some(value) = line.strip_prefix(TITLE_MARKER) {
                let value = value.trim();
                if !value.is_empty() && value != "NA" {
                    title = Some(value.to_string());
                }
            } else if let Some(value) = line.strip_prefix(OUTPUT_MARKER) {
                reported_output = Some(PathBuf::from(value.trim()));
            } else if let Some(native) = parse_progress_line(line) {
                if native >= 100.0 {
                    download_finished = true;
                    return;
                }
                if let Some(percent) = throttle.advance(map_download_progress(native)) {
                    progress(percent, "Downloading");
                }
            } else if !line.trim().is_empty() {
                debug!(line, "yt-dlp");
            }
        })?;

        if download_finished || run.success {
            progress(TRANSCODE_START, "Download finished, converting");
        }

        let title = title.unwrap_or_else(|| request.key.id.to_string());
        let wanted = format.extension();

        if let Some(path) = reported_output
            .filter(|path| has_extension(path, wanted) && path.is_file())
            .or_else(|| find_converted_output(&request.work_dir, wanted))
        {
            if !run.success {
                warn!(key = %request.key, status = %run.status, "yt-dlp failed after producing output");
            }
            return Ok(ConvertOutput { path, title });
        }

        let Some(leftover) = find_leftover(&request.work_dir) else {
            let message = if run.success {
                "yt-dlp produced no output file".to_string()
            } else {
                format!("yt-dlp exited with {}", run.status)
            };
            return Err(ConvertError::invocation_with(message, run.stderr_tail));
        };

        warn!(
            key = %request.key,
            leftover = %leftover.display(),
            "no {wanted} output from yt-dlp, transcoding leftover file"
        );
        progress(FALLBACK_TRANSCODE, "Converting with ffmpeg");
        let target = output_path(&request.work_dir, request, format);
        self.transcoder
            .transcode(&leftover, &target, format)
            .map_err(|err| match err {
                ConvertError::InvocationFailure {
                    message,
                    diagnostics,
                } => ConvertError::invocation_with(
                    format!("fallback conversion failed: {message}"),
                    [run.stderr_tail.as_str(), diagnostics.as_deref().unwrap_or("")]
                        .iter()
                        .filter(|part| !part.is_empty())
                        .copied()
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                other => other,
            })?;
        Ok(ConvertOutput {
            path: target,
            title,
        })
    }

    fn convert_upload(
        &self,
        request: &ConvertRequest,
        input: &Path,
        original_name: &str,
        progress: &dyn Fn(u8, &str),
    ) -> Result<ConvertOutput> {
        let profile = request.key.profile;
        let extension = Path::new(original_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");
        if !profile.accepts_upload_extension(extension) {
            return Err(ConvertError::InvalidInput(format!(
                "unsupported file format for {profile}; expected one of: {}",
                profile.accepted_upload_extensions().join(", ")
            )));
        }

        progress(DOWNLOAD_START, "Preparing upload");
        progress(TRANSCODE_START, "Converting");
        let target = output_path(&request.work_dir, request, profile.format());
        self.transcoder.transcode(input, &target, profile.format())?;

        let title = Path::new(original_name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.trim().is_empty())
            .unwrap_or_else(|| request.key.id.to_string());
        Ok(ConvertOutput {
            path: target,
            title,
        })
    }

    fn download_command(&self, profile: Profile, url: &str, work_dir: &Path) -> Command {
        let mut command = Command::new(&self.ytdlp_bin);
        command
            .arg("--no-playlist")
            .arg("--newline")
            .arg("--no-warnings")
            .arg("--progress")
            .arg("--no-simulate")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("--print")
            .arg(format!("before_dl:{TITLE_MARKER}%(title)s"))
            .arg("--print")
            .arg(format!("after_move:{OUTPUT_MARKER}%(filepath)s"))
            .arg("-o")
            .arg(work_dir.join("%(id)s.%(ext)s"));

        match profile.format() {
            TargetFormat::Mp4 => {
                command
                    .arg("-f")
                    .arg("bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/b")
                    .arg("--merge-output-format")
                    .arg("mp4");
            }
            format => {
                command
                    .arg("-f")
                    .arg("bestaudio/best")
                    .arg("-x")
                    .arg("--audio-format")
                    .arg(format.extension())
                    .arg("--audio-quality")
                    .arg(format!("{}K", self.audio_quality.trim_end_matches(['k', 'K'])));
            }
        }

        let ffmpeg = self.transcoder.ffmpeg_bin();
        if ffmpeg.components().count() > 1 {
            command.arg("--ffmpeg-location").arg(ffmpeg);
        }

        command.arg(url);
        command
    }
}

impl Converter for ToolConverter {
    fn convert(
        &self,
        request: &ConvertRequest,
        progress: &dyn Fn(u8, &str),
    ) -> Result<ConvertOutput> {
        match &request.source {
            ConvertSource::Url(url) => self.convert_url(request, url, progress),
            ConvertSource::Upload {
                path,
                original_name,
            } => self.convert_upload(request, path, original_name, progress),
        }
    }
}

fn output_path(work_dir: &Path, request: &ConvertRequest, format: TargetFormat) -> PathBuf {
    work_dir.join(format!("{}.{}", request.key.id, format.extension()))
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted))
}

/// yt-dlp names unmerged streams `<id>.f<format>.<ext>`; those are inputs,
/// not results.
fn is_format_fragment(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.rsplit_once('.'))
        .is_some_and(|(_, tail)| {
            tail.len() > 1
                && tail.starts_with('f')
                && tail[1..].chars().all(|c| c.is_ascii_digit())
        })
}

fn is_scratch_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            matches!(
                ext.to_ascii_lowercase().as_str(),
                "part" | "ytdl" | "json" | "tmp" | "temp" | "description" | "jpg" | "webp"
                    | "png"
            )
        })
}

fn files_in(dir: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
}

fn find_converted_output(work_dir: &Path, wanted: &str) -> Option<PathBuf> {
    files_in(work_dir).find(|path| has_extension(path, wanted) && !is_format_fragment(path))
}

/// Newest non-scratch file the downloader left behind.
fn find_leftover(work_dir: &Path) -> Option<PathBuf> {
    files_in(work_dir)
        .filter(|path| !is_scratch_file(path))
        .max_by_key(|path| {
            path.metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
}
