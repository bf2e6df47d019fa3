#![forbid(unsafe_code)]

use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by the conversion pipeline.
///
/// Runners never let these escape their task: they end up as an `Error`
/// job status. Callers of the service operations see them directly.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// No job identifier can be derived from the submitted source.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The external tool failed or left no usable output behind.
    #[error("{message}")]
    InvocationFailure {
        message: String,
        /// Tail of the tool's own diagnostic output, if any.
        diagnostics: Option<String>,
    },

    /// The store claims completion but the artifact is gone. Retryable.
    #[error("converted file is missing, please resubmit")]
    ArtifactMissing,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{context} '{}': {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConvertError {
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::InvocationFailure {
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn invocation_with(message: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        let diagnostics = diagnostics.into();
        Self::InvocationFailure {
            message: message.into(),
            diagnostics: (!diagnostics.trim().is_empty()).then_some(diagnostics),
        }
    }

    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// Text stored in an `Error` job status. Includes the tool diagnostics so
    /// the poller sees why the conversion failed.
    pub fn status_message(&self) -> String {
        match self {
            Self::InvocationFailure {
                message,
                diagnostics: Some(diagnostics),
            } => format!("{message}: {diagnostics}"),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_message_appends_diagnostics() {
        let err = ConvertError::invocation_with("yt-dlp failed", "ERROR: Video unavailable");
        assert_eq!(err.status_message(), "yt-dlp failed: ERROR: Video unavailable");
        assert_eq!(err.to_string(), "yt-dlp failed");
    }

    #[test]
    fn blank_diagnostics_are_dropped() {
        let err = ConvertError::invocation_with("ffmpeg failed", "  \n");
        assert!(matches!(
            err,
            ConvertError::InvocationFailure {
                diagnostics: None,
                ..
            }
        ));
    }

    #[test]
    fn io_error_names_path() {
        let err = ConvertError::io(
            "creating directory",
            "/tmp/x",
            std::io::Error::other("denied"),
        );
        assert_eq!(err.to_string(), "creating directory '/tmp/x': denied");
    }
}
