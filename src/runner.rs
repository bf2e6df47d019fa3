#![forbid(unsafe_code)]

//! One background task per conversion. The task owns the job's store entry
//! from claim until it writes the terminal status.

use std::fs;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::artifact::{ArtifactLayout, display_filename};
use crate::error::{ConvertError, Result};
use crate::identifier::JobKey;
use crate::invoker::{ConvertRequest, ConvertSource, Converter};
use crate::status::JobStatus;
use crate::store::JobStore;

#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    converter: Arc<dyn Converter>,
    layout: ArtifactLayout,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        converter: Arc<dyn Converter>,
        layout: ArtifactLayout,
    ) -> Self {
        Self {
            store,
            converter,
            layout,
        }
    }

    /// Runs the conversion for an already-claimed `key` in the background.
    /// The returned task always finishes by writing a terminal status.
    pub fn launch(&self, key: JobKey, source: ConvertSource) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            let description = source.describe();
            let staged_upload = match &source {
                ConvertSource::Upload { path, .. } => Some(path.clone()),
                ConvertSource::Url(_) => None,
            };
            info!(%key, source = %description, "conversion started");

            let outcome = runner.run(&key, source).await;
            if let Some(path) = staged_upload {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "could not delete staged upload");
                    }
                }
            }

            match outcome {
                Ok(filename) => {
                    info!(%key, %filename, "conversion complete");
                    runner
                        .store
                        .put(&key, JobStatus::complete(description, filename));
                }
                Err(err) => {
                    runner.layout.remove(&key);
                    warn!(%key, error = %err.status_message(), "conversion failed");
                    runner
                        .store
                        .put(&key, JobStatus::error(description, err.status_message()));
                }
            }
        })
    }

    /// Converts inside a fresh work directory and moves the result into
    /// place. Returns the download filename shown to the user.
    async fn run(&self, key: &JobKey, source: ConvertSource) -> Result<String> {
        let work_dir = self.layout.work_dir(key)?;
        let request = ConvertRequest {
            key: key.clone(),
            source,
            work_dir: work_dir.path().to_path_buf(),
        };

        let store = self.store.clone();
        let converter = self.converter.clone();
        let layout = self.layout.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let progress = |percent: u8, message: &str| {
                store.record_progress(&request.key, percent, message);
            };
            let output = converter.convert(&request, &progress)?;
            layout.place(&output.path, &request.key)?;
            Ok::<_, ConvertError>(output.title)
        })
        .await;
        drop(work_dir);

        let title = match joined {
            Ok(result) => result?,
            Err(err) => {
                warn!(%key, error = %err, "conversion task aborted");
                return Err(ConvertError::invocation(
                    "conversion crashed unexpectedly, please try again",
                ));
            }
        };
        Ok(display_filename(
            &title,
            key.id.as_str(),
            key.profile.extension(),
        ))
    }
}
