#![forbid(unsafe_code)]

//! Entry point used by the HTTP layer: submit, poll, download.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mime_guess::mime::Mime;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::artifact::{ArtifactLayout, CleanupScheduler};
use crate::config::RuntimeSettings;
use crate::error::{ConvertError, Result};
use crate::identifier::{JobIdentifier, JobKey};
use crate::invoker::{ConvertSource, Converter};
use crate::profile::{Profile, SourceKind};
use crate::runner::JobRunner;
use crate::status::{JobState, JobStatus, StatusPayload, reconcile};
use crate::store::JobStore;

/// Floor for how often the retention sweeper looks for stale files.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ArtifactDownload {
    pub path: PathBuf,
    pub filename: String,
    pub content_type: Mime,
}

pub struct ConversionService {
    layout: ArtifactLayout,
    store: Arc<dyn JobStore>,
    runner: JobRunner,
    cleanup: CleanupScheduler,
    max_retention: Duration,
    tasks: Mutex<HashMap<JobKey, JoinHandle<()>>>,
}

impl ConversionService {
    pub fn new(
        settings: &RuntimeSettings,
        store: Arc<dyn JobStore>,
        converter: Arc<dyn Converter>,
    ) -> Result<Self> {
        let layout = ArtifactLayout::new(&settings.downloads_dir);
        layout.prepare()?;
        let runner = JobRunner::new(store.clone(), converter, layout.clone());
        let cleanup = CleanupScheduler::new(
            layout.clone(),
            store.clone(),
            settings.cleanup_delay,
            settings.max_retention,
        );
        Ok(Self {
            layout,
            store,
            runner,
            cleanup,
            max_retention: settings.max_retention,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Starts converting `source_url` unless the same job is already running
    /// or its artifact exists. Either way the job's identifier is returned.
    pub fn submit(&self, profile: Profile, source_url: &str) -> Result<JobIdentifier> {
        if profile.source_kind() == SourceKind::Upload {
            return Err(ConvertError::InvalidInput(format!(
                "{profile} converts uploaded files, not links"
            )));
        }
        let source_url = source_url.trim();
        let id = JobIdentifier::from_source_url(profile, source_url)?;
        let key = JobKey::new(profile, id.clone());

        if !self.claim(&key, JobStatus::processing(source_url)) {
            return Ok(id);
        }
        self.launch(key, ConvertSource::Url(source_url.to_string()));
        Ok(id)
    }

    /// Stages an uploaded file and converts it. Identical uploads share one
    /// job.
    pub fn submit_upload(
        &self,
        profile: Profile,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<JobIdentifier> {
        if profile.source_kind() != SourceKind::Upload {
            return Err(ConvertError::InvalidInput(format!(
                "{profile} converts links, not uploaded files"
            )));
        }
        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !profile.accepts_upload_extension(&extension) {
            return Err(ConvertError::InvalidInput(format!(
                "{profile} accepts {} files",
                profile.accepted_upload_extensions().join(", ")
            )));
        }
        if bytes.is_empty() {
            return Err(ConvertError::InvalidInput(
                "uploaded file is empty".to_string(),
            ));
        }

        let id = JobIdentifier::from_upload(bytes);
        let key = JobKey::new(profile, id.clone());
        if !self.claim(&key, JobStatus::processing(file_name)) {
            return Ok(id);
        }

        let staged = match self.stage_upload(&key, &extension, bytes) {
            Ok(path) => path,
            Err(err) => {
                self.store
                    .put(&key, JobStatus::error(file_name, err.status_message()));
                return Err(err);
            }
        };
        self.launch(
            key,
            ConvertSource::Upload {
                path: staged,
                original_name: file_name.to_string(),
            },
        );
        Ok(id)
    }

    /// Takes ownership of `key` for a new runner. Refused while the artifact
    /// exists or another runner is active. The artifact is checked again
    /// after claiming, since a runner may have finished in between.
    fn claim(&self, key: &JobKey, status: JobStatus) -> bool {
        if self.layout.exists(key) {
            debug!(%key, "artifact already present, not relaunching");
            return false;
        }
        let previous = self.store.get(key);
        let source = status.source.clone();
        if !self.store.try_claim(key, status) {
            debug!(%key, "conversion already running, not relaunching");
            return false;
        }
        if self.layout.exists(key) {
            debug!(%key, "runner finished while claiming, not relaunching");
            let restored = previous
                .filter(|status| status.state == JobState::Complete)
                .unwrap_or_else(|| JobStatus::complete(source, self.layout.file_name(key)));
            self.store.put(key, restored);
            return false;
        }
        true
    }

    fn stage_upload(&self, key: &JobKey, extension: &str, bytes: &[u8]) -> Result<PathBuf> {
        let staging = self.layout.staging_dir();
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}.", self.layout.file_name(key)))
            .suffix(&format!(".{extension}"))
            .tempfile_in(&staging)
            .map_err(|err| ConvertError::io("staging upload", &staging, err))?;
        file.write_all(bytes)
            .map_err(|err| ConvertError::io("staging upload", file.path(), err))?;
        let (_, path) = file
            .keep()
            .map_err(|err| ConvertError::io("staging upload", &staging, err.error))?;
        Ok(path)
    }

    fn launch(&self, key: JobKey, source: ConvertSource) {
        info!(%key, "launching conversion");
        let handle = self.runner.launch(key.clone(), source);
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(key, handle);
    }

    pub fn poll(&self, profile: Profile, id: &JobIdentifier) -> StatusPayload {
        let key = JobKey::new(profile, id.clone());
        let entry = self.store.get(&key);
        reconcile(
            &key,
            self.layout.exists(&key),
            entry.as_ref(),
            &self.layout.download_url(&key),
            &self.layout.file_name(&key),
        )
    }

    /// Resolves a finished artifact for serving and schedules its deletion.
    pub fn download(&self, profile: Profile, id: &JobIdentifier) -> Result<ArtifactDownload> {
        let key = JobKey::new(profile, id.clone());
        self.download_key(&key)
    }

    pub fn download_by_file_name(&self, name: &str) -> Result<ArtifactDownload> {
        let key = ArtifactLayout::parse_file_name(name)
            .ok_or_else(|| ConvertError::NotFound(format!("no artifact named '{name}'")))?;
        self.download_key(&key)
    }

    fn download_key(&self, key: &JobKey) -> Result<ArtifactDownload> {
        let path = self.layout.path_for(key);
        if !path.is_file() {
            return Err(ConvertError::NotFound(
                "file not found or already deleted".to_string(),
            ));
        }
        let filename = self
            .store
            .get(key)
            .and_then(|status| status.result_filename)
            .unwrap_or_else(|| self.layout.file_name(key));
        self.cleanup.schedule(key);
        Ok(ArtifactDownload {
            path,
            filename,
            content_type: key.profile.format().content_type(),
        })
    }

    /// Waits for the runner of `(profile, id)` launched by this service, if
    /// one is still tracked.
    pub async fn wait(&self, profile: Profile, id: &JobIdentifier) {
        let key = JobKey::new(profile, id.clone());
        let handle = self.tasks.lock().remove(&key);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn spawn_retention_sweeper(&self) -> JoinHandle<()> {
        self.cleanup
            .spawn_retention_sweeper(sweep_interval(self.max_retention))
    }
}

/// A tenth of the retention period, so artifacts overstay it by at most
/// ten percent.
fn sweep_interval(max_retention: Duration) -> Duration {
    (max_retention / 10).max(MIN_SWEEP_INTERVAL)
}
