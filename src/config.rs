#![forbid(unsafe_code)]

//! Runtime settings resolved from CLI overrides, the process environment and
//! an optional `.env` file, in that order of precedence.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOADS_DIR: &str = "downloads";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CLEANUP_DELAY_SECS: u64 = 30 * 60;
pub const DEFAULT_MAX_RETENTION_SECS: u64 = 6 * 60 * 60;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
pub const DEFAULT_AUDIO_QUALITY: &str = "192";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub downloads_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Delay between the first download of an artifact and its deletion.
    pub cleanup_delay: Duration,
    /// Upper bound on how long any artifact stays on disk.
    pub max_retention: Duration,
    pub tool_timeout: Duration,
    pub ytdlp_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub audio_quality: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from(DEFAULT_DOWNLOADS_DIR),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cleanup_delay: Duration::from_secs(DEFAULT_CLEANUP_DELAY_SECS),
            max_retention: Duration::from_secs(DEFAULT_MAX_RETENTION_SECS),
            tool_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
            ytdlp_bin: PathBuf::from(DEFAULT_YTDLP_BIN),
            ffmpeg_bin: PathBuf::from(DEFAULT_FFMPEG_BIN),
            audio_quality: DEFAULT_AUDIO_QUALITY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub downloads_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cleanup_delay_secs: Option<u64>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_settings(&file_vars, process_env, overrides))
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let seconds = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());
    let defaults = RuntimeSettings::default();

    let downloads_dir = overrides
        .downloads_dir
        .or_else(|| lookup("MEDIACONV_DOWNLOADS_DIR").map(PathBuf::from))
        .unwrap_or(defaults.downloads_dir);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("MEDIACONV_HOST"))
        .unwrap_or(defaults.host);
    let port = overrides
        .port
        .or_else(|| lookup("MEDIACONV_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(defaults.port);
    let cleanup_delay = overrides
        .cleanup_delay_secs
        .or_else(|| seconds("MEDIACONV_CLEANUP_DELAY_SECS"))
        .map(Duration::from_secs)
        .unwrap_or(defaults.cleanup_delay);
    let tool_timeout = seconds("MEDIACONV_TOOL_TIMEOUT_SECS")
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(defaults.tool_timeout);
    // A job may run yt-dlp and then a fallback ffmpeg pass, each bounded by
    // the tool timeout; the sweep must not outpace either.
    let max_retention = seconds("MEDIACONV_MAX_RETENTION_SECS")
        .map(Duration::from_secs)
        .unwrap_or(defaults.max_retention)
        .max(cleanup_delay)
        .max(tool_timeout * 2);

    RuntimeSettings {
        downloads_dir,
        host,
        port,
        cleanup_delay,
        max_retention,
        tool_timeout,
        ytdlp_bin: lookup("MEDIACONV_YTDLP_BIN")
            .map(PathBuf::from)
            .unwrap_or(defaults.ytdlp_bin),
        ffmpeg_bin: lookup("MEDIACONV_FFMPEG_BIN")
            .map(PathBuf::from)
            .unwrap_or(defaults.ffmpeg_bin),
        audio_quality: lookup("MEDIACONV_AUDIO_QUALITY").unwrap_or(defaults.audio_quality),
    }
}

fn process_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn non_blank(value: impl AsRef<str>) -> Option<String> {
    let value = value.as_ref().trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).and_then(non_blank))
}

/// Reads `KEY=value` pairs from a dotenv-style file. A missing file is not
/// an error; settings then come from the environment and defaults.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    Ok(content.lines().filter_map(parse_env_line).collect())
}

/// One assignment, tolerating `export`, comments and matching quotes.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), unquote(value.trim()).to_string()))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}
