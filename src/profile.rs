#![forbid(unsafe_code)]

//! Conversion profiles. A profile pins down where the input comes from, what
//! the artifact is called and which format the tools must produce.

use std::fmt;

use mime_guess::mime::Mime;
use serde::{Deserialize, Serialize};

use crate::error::{ConvertError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    YoutubeMp3,
    YoutubeMp4,
    TiktokMp3,
    Wav,
    Png,
}

/// Output formats the transcoder knows how to produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    Mp3,
    Mp4,
    Wav,
    Png,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    YoutubeUrl,
    TiktokUrl,
    Upload,
}

impl Profile {
    pub const ALL: [Profile; 5] = [
        Profile::YoutubeMp3,
        Profile::YoutubeMp4,
        Profile::TiktokMp3,
        Profile::Wav,
        Profile::Png,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Self::YoutubeMp3 => "youtube-mp3",
            Self::YoutubeMp4 => "youtube-mp4",
            Self::TiktokMp3 => "tiktok-mp3",
            Self::Wav => "wav",
            Self::Png => "png",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace(['_', '/'], "-");
        Self::ALL
            .into_iter()
            .find(|profile| profile.slug() == normalized)
            .ok_or_else(|| ConvertError::NotFound(format!("unknown conversion '{value}'")))
    }

    /// Leading component of the artifact file name.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::YoutubeMp3 | Self::YoutubeMp4 => "youtube",
            Self::TiktokMp3 => "tiktok",
            Self::Wav | Self::Png => "upload",
        }
    }

    pub fn format(self) -> TargetFormat {
        match self {
            Self::YoutubeMp3 | Self::TiktokMp3 => TargetFormat::Mp3,
            Self::YoutubeMp4 => TargetFormat::Mp4,
            Self::Wav => TargetFormat::Wav,
            Self::Png => TargetFormat::Png,
        }
    }

    pub fn extension(self) -> &'static str {
        self.format().extension()
    }

    pub fn source_kind(self) -> SourceKind {
        match self {
            Self::YoutubeMp3 | Self::YoutubeMp4 => SourceKind::YoutubeUrl,
            Self::TiktokMp3 => SourceKind::TiktokUrl,
            Self::Wav | Self::Png => SourceKind::Upload,
        }
    }

    /// Reverse of `prefix` + `extension`; each pair belongs to one profile.
    pub fn from_artifact_parts(prefix: &str, extension: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|profile| profile.prefix() == prefix && profile.extension() == extension)
    }

    /// Input extensions an upload profile is willing to transcode.
    pub fn accepted_upload_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Wav => &["mp3", "mp4", "m4a"],
            Self::Png => &["webp"],
            _ => &[],
        }
    }

    pub fn accepts_upload_extension(self, extension: &str) -> bool {
        let extension = extension.to_ascii_lowercase();
        self.accepted_upload_extensions()
            .iter()
            .any(|candidate| *candidate == extension)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl TargetFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Mp4 => "mp4",
            Self::Wav => "wav",
            Self::Png => "png",
        }
    }

    pub fn content_type(self) -> Mime {
        mime_guess::from_ext(self.extension()).first_or_octet_stream()
    }
}
