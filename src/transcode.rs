#![forbid(unsafe_code)]

//! Direct ffmpeg invocations, used for uploads and as the fallback when the
//! downloader leaves an unconverted file behind.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::error::{ConvertError, Result};
use crate::process::run_streaming;
use crate::profile::TargetFormat;

#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg_bin: PathBuf,
    timeout: Duration,
    audio_quality: String,
}

impl Transcoder {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, timeout: Duration, audio_quality: &str) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            timeout,
            audio_quality: audio_quality.to_string(),
        }
    }

    pub fn ffmpeg_bin(&self) -> &Path {
        &self.ffmpeg_bin
    }

    /// Converts `input` into `output` in the requested format, overwriting
    /// `output` if present.
    pub fn transcode(&self, input: &Path, output: &Path, format: TargetFormat) -> Result<()> {
        let mut command = Command::new(&self.ffmpeg_bin);
        command
            .arg("-hide_banner")
            .arg("-nostdin")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args(self.format_args(format))
            .arg(output);

        debug!(input = %input.display(), output = %output.display(), "running ffmpeg");
        let run = run_streaming(command, "ffmpeg", self.timeout, |_| {})?;
        if !run.success {
            return Err(ConvertError::invocation_with(
                format!("ffmpeg exited with {}", run.status),
                run.stderr_tail,
            ));
        }
        if !output.is_file() {
            return Err(ConvertError::invocation_with(
                "ffmpeg produced no output file",
                run.stderr_tail,
            ));
        }
        Ok(())
    }

    fn format_args(&self, format: TargetFormat) -> Vec<String> {
        let args: Vec<&str> = match format {
            TargetFormat::Mp3 => vec!["-vn", "-codec:a", "libmp3lame", "-b:a"],
            TargetFormat::Mp4 => vec![
                "-c:v",
                "libx264",
                "-c:a",
                "aac",
                "-movflags",
                "+faststart",
            ],
            TargetFormat::Wav => vec!["-vn", "-acodec", "pcm_s16le"],
            TargetFormat::Png => vec!["-frames:v", "1"],
        };
        let mut args: Vec<String> = args.into_iter().map(str::to_string).collect();
        if format == TargetFormat::Mp3 {
            args.push(format!("{}k", self.audio_quality.trim_end_matches('k')));
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcoder(bin: impl Into<PathBuf>) -> Transcoder {
        Transcoder::new(bin, Duration::from_secs(10), "192")
    }

    #[test]
    fn mp3_args_carry_bitrate() {
        let args = transcoder("ffmpeg").format_args(TargetFormat::Mp3);
        assert_eq!(args.last().map(String::as_str), Some("192k"));
        assert!(args.contains(&"libmp3lame".to_string()));
    }

    #[test]
    fn png_keeps_a_single_frame() {
        let args = transcoder("ffmpeg").format_args(TargetFormat::Png);
        assert_eq!(args, vec!["-frames:v", "1"]);
    }

    #[cfg(unix)]
    mod stubbed {
        use super::*;
        use crate::test_support::install_ffmpeg_stub;
        use std::fs;

        #[test]
        fn transcode_writes_output() {
            let dir = tempfile::tempdir().unwrap();
            let stub = install_ffmpeg_stub(dir.path());
            let input = dir.path().join("clip.webm");
            let output = dir.path().join("clip.mp3");
            fs::write(&input, b"audio").unwrap();

            transcoder(stub)
                .transcode(&input, &output, TargetFormat::Mp3)
                .unwrap();
            assert_eq!(fs::read(&output).unwrap(), b"audio");
        }

        #[test]
        fn transcode_failure_carries_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let stub = install_ffmpeg_stub(dir.path());
            let input = dir.path().join("broken.webm");
            fs::write(&input, b"junk").unwrap();

            let err = transcoder(stub)
                .transcode(&input, &dir.path().join("out.mp3"), TargetFormat::Mp3)
                .unwrap_err();
            assert!(
                err.status_message()
                    .contains("Invalid data found when processing input")
            );
        }
    }
}
