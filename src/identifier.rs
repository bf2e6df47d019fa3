#![forbid(unsafe_code)]

//! Deterministic job identifiers.
//!
//! The same source always yields the same identifier, which is what lets a
//! resubmission find the job (or the finished artifact) that already exists.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConvertError, Result};
use crate::profile::{Profile, SourceKind};

const MAX_ID_LEN: usize = 64;
const UPLOAD_ID_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobIdentifier(String);

/// Store key: the same video converted to mp3 and mp4 are two jobs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub profile: Profile,
    pub id: JobIdentifier,
}

impl JobKey {
    pub fn new(profile: Profile, id: JobIdentifier) -> Self {
        Self { profile, id }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.profile, self.id)
    }
}

impl JobIdentifier {
    /// Validates an identifier coming back from a client (poll or download).
    pub fn parse(value: &str) -> Result<Self> {
        if is_valid_id(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(ConvertError::NotFound(format!("unknown job '{value}'")))
        }
    }

    pub fn from_source_url(profile: Profile, raw: &str) -> Result<Self> {
        let id = match profile.source_kind() {
            SourceKind::YoutubeUrl => youtube_video_id(raw),
            SourceKind::TiktokUrl => tiktok_video_id(raw),
            SourceKind::Upload => {
                return Err(ConvertError::InvalidInput(format!(
                    "{profile} expects an uploaded file, not a URL"
                )));
            }
        };
        id.map(Self).ok_or_else(|| {
            ConvertError::InvalidInput(format!("could not find a video id in '{}'", raw.trim()))
        })
    }

    /// Content-derived identifier for uploads.
    pub fn from_upload(bytes: &[u8]) -> Self {
        let digest = blake3::hash(bytes).to_hex();
        Self(digest[..UPLOAD_ID_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_valid_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn parse_url(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Url::parse(trimmed)
        .or_else(|_| Url::parse(&format!("https://{trimmed}")))
        .ok()
}

fn host_matches(url: &Url, domain: &str) -> bool {
    url.host_str().is_some_and(|host| {
        let host = host.to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    })
}

/// Extracts the video id from `watch?v=`, `youtu.be/`, `/shorts/`, `/embed/`
/// and `/live/` style links.
pub fn youtube_video_id(raw: &str) -> Option<String> {
    let url = parse_url(raw)?;
    let mut segments = url.path_segments()?.filter(|segment| !segment.is_empty());

    let candidate = if host_matches(&url, "youtu.be") {
        segments.next().map(str::to_string)
    } else if host_matches(&url, "youtube.com") || host_matches(&url, "youtube-nocookie.com") {
        let from_query = url
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned());
        from_query.or_else(|| match segments.next() {
            Some("shorts" | "embed" | "live" | "v") => segments.next().map(str::to_string),
            _ => None,
        })
    } else {
        None
    };

    candidate.filter(|id| is_valid_id(id))
}

/// Extracts the numeric id from `/@user/video/<id>` and
/// `/music/<slug>-<id>` links.
pub fn tiktok_video_id(raw: &str) -> Option<String> {
    let url = parse_url(raw)?;
    if !host_matches(&url, "tiktok.com") {
        return None;
    }
    let segments: Vec<&str> = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .collect();

    for window in segments.windows(2) {
        match window[0] {
            "video" | "photo" => {
                let id = window[1];
                if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
                    return Some(id.to_string());
                }
            }
            "music" => {
                let id = window[1].rsplit('-').next().unwrap_or_default();
                if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
                    return Some(id.to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn youtube_watch_and_short_links() {
        for url in [
            "https://youtube.com/watch?v=ABC123",
            "https://www.youtube.com/watch?v=ABC123&t=42s",
            "https://m.youtube.com/watch?feature=share&v=ABC123",
            "https://music.youtube.com/watch?v=ABC123&list=RD",
            "https://youtu.be/ABC123",
            "https://youtu.be/ABC123?si=tracking",
            "youtu.be/ABC123",
            "https://www.youtube.com/shorts/ABC123",
            "https://www.youtube.com/embed/ABC123",
            "  https://youtube.com/watch?v=ABC123  ",
        ] {
            assert_eq!(youtube_video_id(url).as_deref(), Some("ABC123"), "{url}");
        }
    }

    #[test]
    fn youtube_ids_keep_dashes_and_underscores() {
        assert_eq!(
            youtube_video_id("https://youtu.be/a-b_C1").as_deref(),
            Some("a-b_C1")
        );
    }

    #[test]
    fn youtube_rejects_foreign_and_empty_links() {
        assert_eq!(youtube_video_id("https://vimeo.com/watch?v=ABC123"), None);
        assert_eq!(youtube_video_id("https://youtube.com/feed/trending"), None);
        assert_eq!(youtube_video_id("https://youtube.com/watch?v="), None);
        assert_eq!(youtube_video_id("https://youtube.com/watch?v=../etc"), None);
        assert_eq!(youtube_video_id(""), None);
    }

    #[test]
    fn tiktok_video_and_music_links() {
        assert_eq!(
            tiktok_video_id("https://www.tiktok.com/@someone/video/7301234567890123456").as_deref(),
            Some("7301234567890123456")
        );
        assert_eq!(
            tiktok_video_id("https://www.tiktok.com/music/original-sound-7212345678901234567")
                .as_deref(),
            Some("7212345678901234567")
        );
        assert_eq!(tiktok_video_id("https://www.tiktok.com/@someone"), None);
        assert_eq!(tiktok_video_id("https://youtube.com/video/123"), None);
    }

    #[test]
    fn from_source_url_reports_invalid_input() {
        let id = JobIdentifier::from_source_url(
            Profile::YoutubeMp3,
            "https://youtube.com/watch?v=ABC123",
        )
        .unwrap();
        assert_eq!(id.as_str(), "ABC123");

        let err = JobIdentifier::from_source_url(Profile::YoutubeMp3, "not a link").unwrap_err();
        assert!(matches!(err, ConvertError::InvalidInput(_)));

        let err = JobIdentifier::from_source_url(Profile::Wav, "https://youtu.be/x").unwrap_err();
        assert!(matches!(err, ConvertError::InvalidInput(_)));
    }

    #[test]
    fn upload_ids_are_content_derived() {
        let first = JobIdentifier::from_upload(b"RIFF....WEBP");
        let again = JobIdentifier::from_upload(b"RIFF....WEBP");
        let other = JobIdentifier::from_upload(b"ID3 mp3 bytes");
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(first.as_str().len(), 16);
    }

    #[test]
    fn parse_rejects_path_like_values() {
        assert!(JobIdentifier::parse("ABC123").is_ok());
        assert!(JobIdentifier::parse("../secret").is_err());
        assert!(JobIdentifier::parse("").is_err());
    }
}
