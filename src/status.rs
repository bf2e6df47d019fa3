#![forbid(unsafe_code)]

//! Job status records and the poll payload built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identifier::JobKey;
use crate::progress::COMPLETE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Complete,
    Error,
}

impl JobState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// One record per in-flight or finished job. Advisory only: the artifact on
/// disk decides whether a job is really complete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub state: JobState,
    pub progress: u8,
    pub message: String,
    /// Display name offered at download time; set only once complete.
    pub result_filename: Option<String>,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub fn processing(source: impl Into<String>) -> Self {
        Self {
            state: JobState::Processing,
            progress: 0,
            message: "Starting conversion".to_string(),
            result_filename: None,
            source: source.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn complete(source: impl Into<String>, result_filename: impl Into<String>) -> Self {
        Self {
            state: JobState::Complete,
            progress: COMPLETE,
            message: "Conversion complete".to_string(),
            result_filename: Some(result_filename.into()),
            source: source.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            state: JobState::Error,
            progress: 0,
            message: message.into(),
            result_filename: None,
            source: source.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Value of the `status` field in a poll response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Queued,
    Processing,
    Complete,
    Error,
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub id: String,
    pub status: PollState,
    pub progress: u8,
    pub message: String,
    pub complete: bool,
    pub file_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub error: bool,
}

/// Two-source reconciliation between the artifact on disk and the store.
///
/// 1. Artifact present: complete, whatever the store says (covers restarts
///    and a runner that has not written its final status yet).
/// 2. Store entry present: reported as is, except a `Complete` entry whose
///    artifact vanished, which becomes a retryable error.
/// 3. Neither: `not_found`. Not an error; the id may simply have expired.
pub fn reconcile(
    key: &JobKey,
    artifact_present: bool,
    entry: Option<&JobStatus>,
    download_url: &str,
    artifact_name: &str,
) -> StatusPayload {
    let id = key.id.to_string();

    if artifact_present {
        let filename = entry
            .and_then(|status| status.result_filename.clone())
            .unwrap_or_else(|| artifact_name.to_string());
        return StatusPayload {
            id,
            status: PollState::Complete,
            progress: COMPLETE,
            message: "Your file is ready".to_string(),
            complete: true,
            file_ready: true,
            download_url: Some(download_url.to_string()),
            filename: Some(filename),
            error: false,
        };
    }

    let Some(status) = entry else {
        return StatusPayload {
            id,
            status: PollState::NotFound,
            progress: 0,
            message: "No conversion found for this id; it may have expired".to_string(),
            complete: false,
            file_ready: false,
            download_url: None,
            filename: None,
            error: false,
        };
    };

    match status.state {
        JobState::Complete => StatusPayload {
            id,
            status: PollState::Error,
            progress: 0,
            message: crate::error::ConvertError::ArtifactMissing.to_string(),
            complete: false,
            file_ready: false,
            download_url: None,
            filename: None,
            error: true,
        },
        JobState::Error => StatusPayload {
            id,
            status: PollState::Error,
            progress: 0,
            message: status.message.clone(),
            complete: false,
            file_ready: false,
            download_url: None,
            filename: None,
            error: true,
        },
        JobState::Queued | JobState::Processing => StatusPayload {
            id,
            status: if status.state == JobState::Queued {
                PollState::Queued
            } else {
                PollState::Processing
            },
            progress: status.progress.min(COMPLETE),
            message: status.message.clone(),
            complete: false,
            file_ready: false,
            download_url: None,
            filename: None,
            error: false,
        },
    }
}
