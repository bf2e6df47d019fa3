#![forbid(unsafe_code)]

//! Deterministic artifact paths and their deletion policy.
//!
//! Artifacts live at `<downloads>/<prefix>_<id>.<ext>`. Scratch space for
//! running jobs (`.work`) and staged uploads (`.staging`) sit next to them
//! so finished files can be renamed into place on the same filesystem.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{ConvertError, Result};
use crate::identifier::{JobIdentifier, JobKey};
use crate::profile::Profile;
use crate::store::JobStore;

const WORK_SUBDIR: &str = ".work";
const STAGING_SUBDIR: &str = ".staging";
pub const DOWNLOAD_ROUTE: &str = "/downloads";

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    downloads_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn new(downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn prepare(&self) -> Result<()> {
        for dir in [
            self.downloads_dir.clone(),
            self.work_root(),
            self.staging_dir(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|err| ConvertError::io("creating directory", &dir, err))?;
        }
        Ok(())
    }

    pub fn file_name(&self, key: &JobKey) -> String {
        format!(
            "{}_{}.{}",
            key.profile.prefix(),
            key.id,
            key.profile.extension()
        )
    }

    pub fn path_for(&self, key: &JobKey) -> PathBuf {
        self.downloads_dir.join(self.file_name(key))
    }

    pub fn download_url(&self, key: &JobKey) -> String {
        format!("{DOWNLOAD_ROUTE}/{}", self.file_name(key))
    }

    /// Inverse of [`file_name`](Self::file_name).
    pub fn parse_file_name(name: &str) -> Option<JobKey> {
        let (stem, extension) = name.rsplit_once('.')?;
        let (prefix, id) = stem.split_once('_')?;
        let profile = Profile::from_artifact_parts(prefix, extension)?;
        let id = JobIdentifier::parse(id).ok()?;
        Some(JobKey::new(profile, id))
    }

    /// Key owning a scratch entry named `<artifact name>.<random>` or
    /// `<artifact name>.<random>.<ext>`.
    pub fn scratch_owner(name: &str) -> Option<JobKey> {
        let mut stem = name;
        for _ in 0..2 {
            stem = stem.rsplit_once('.')?.0;
            if let Some(key) = Self::parse_file_name(stem) {
                return Some(key);
            }
        }
        None
    }

    pub fn exists(&self, key: &JobKey) -> bool {
        self.path_for(key).is_file()
    }

    fn work_root(&self) -> PathBuf {
        self.downloads_dir.join(WORK_SUBDIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.downloads_dir.join(STAGING_SUBDIR)
    }

    /// Fresh scratch directory for one job, removed when dropped.
    pub fn work_dir(&self, key: &JobKey) -> Result<TempDir> {
        let root = self.work_root();
        fs::create_dir_all(&root)
            .map_err(|err| ConvertError::io("creating directory", &root, err))?;
        tempfile::Builder::new()
            .prefix(&format!("{}.", self.file_name(key)))
            .tempdir_in(&root)
            .map_err(|err| ConvertError::io("creating work directory", &root, err))
    }

    /// Moves `source` to the artifact path. Across filesystems the copy goes
    /// to a sibling first, so the final path only ever holds a whole file.
    pub fn place(&self, source: &Path, key: &JobKey) -> Result<PathBuf> {
        let target = self.path_for(key);
        if source == target {
            return Ok(target);
        }
        if fs::rename(source, &target).is_ok() {
            return Ok(target);
        }

        let partial = target.with_extension(format!("{}.partial", key.profile.extension()));
        fs::copy(source, &partial)
            .map_err(|err| ConvertError::io("copying artifact", &partial, err))?;
        if let Err(err) = fs::rename(&partial, &target) {
            let _ = fs::remove_file(&partial);
            return Err(ConvertError::io("moving artifact into place", &target, err));
        }
        let _ = fs::remove_file(source);
        Ok(target)
    }

    /// Removes the artifact if present. Returns whether a file was deleted.
    pub fn remove(&self, key: &JobKey) -> bool {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not delete artifact");
                false
            }
        }
    }
}

/// Name offered to the browser: the title reduced to word characters,
/// like `Some_Song` -> `SomeSong.mp3`.
pub fn display_filename(title: &str, fallback: &str, extension: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    let base = if cleaned.is_empty() { fallback } else { &cleaned };
    format!("{base}.{extension}")
}

/// Deletes artifacts a fixed delay after their first download, and sweeps
/// anything older than the retention limit.
#[derive(Clone)]
pub struct CleanupScheduler {
    inner: Arc<CleanupInner>,
}

struct CleanupInner {
    layout: ArtifactLayout,
    store: Arc<dyn JobStore>,
    delay: Duration,
    max_retention: Duration,
    scheduled: Mutex<HashSet<JobKey>>,
}

impl CleanupScheduler {
    pub fn new(
        layout: ArtifactLayout,
        store: Arc<dyn JobStore>,
        delay: Duration,
        max_retention: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CleanupInner {
                layout,
                store,
                delay,
                max_retention,
                scheduled: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn is_scheduled(&self, key: &JobKey) -> bool {
        self.inner.scheduled.lock().contains(key)
    }

    /// Schedules deletion of `key`'s artifact. Only the first call per
    /// artifact lifetime spawns a timer; later calls return `None`.
    pub fn schedule(&self, key: &JobKey) -> Option<JoinHandle<()>> {
        if !self.inner.scheduled.lock().insert(key.clone()) {
            return None;
        }
        let deadline = tokio::time::Instant::now() + self.inner.delay;
        let inner = self.inner.clone();
        let key = key.clone();
        debug!(%key, delay_secs = inner.delay.as_secs(), "scheduled artifact deletion");
        Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            inner.scheduled.lock().remove(&key);
            inner.expire(&key);
        }))
    }

    /// Deletes artifacts, staged uploads and abandoned work directories
    /// last modified more than `max_retention` before `now`, and forgets
    /// finished jobs that old. Scratch space of running jobs is kept.
    pub fn sweep_expired(&self, now: SystemTime) -> usize {
        let inner = &self.inner;
        let expired = |path: &Path| {
            path.metadata()
                .and_then(|meta| meta.modified())
                .map(|modified| {
                    now.duration_since(modified).unwrap_or_default() > inner.max_retention
                })
                .unwrap_or(false)
        };

        let mut removed = 0;
        let entries = WalkDir::new(inner.layout.downloads_dir())
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| entry.ok());
        for entry in entries {
            let path = entry.path();
            if !expired(path) {
                continue;
            }
            let parent_is_scratch = path
                .parent()
                .and_then(|parent| parent.file_name())
                .is_some_and(|name| name == WORK_SUBDIR || name == STAGING_SUBDIR);

            if entry.depth() == 1 && entry.file_type().is_file() {
                let Some(key) = entry
                    .file_name()
                    .to_str()
                    .and_then(ArtifactLayout::parse_file_name)
                else {
                    continue;
                };
                if inner.expire(&key) {
                    removed += 1;
                }
            } else if entry.depth() == 2 && parent_is_scratch {
                let running = entry
                    .file_name()
                    .to_str()
                    .and_then(ArtifactLayout::scratch_owner)
                    .and_then(|key| inner.store.get(&key))
                    .is_some_and(|status| status.state.is_active());
                if running {
                    continue;
                }
                let result = if entry.file_type().is_dir() {
                    fs::remove_dir_all(path)
                } else {
                    fs::remove_file(path)
                };
                match result {
                    Ok(()) => removed += 1,
                    Err(err) => warn!(path = %path.display(), error = %err, "sweep failed"),
                }
            }
        }
        let forgotten = chrono::Duration::from_std(inner.max_retention)
            .ok()
            .and_then(|age| DateTime::<Utc>::from(now).checked_sub_signed(age))
            .map(|cutoff| inner.store.prune_terminal(cutoff))
            .unwrap_or(0);
        if removed > 0 || forgotten > 0 {
            info!(removed, forgotten, "retention sweep finished");
        }
        removed
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `interval`.
    pub fn spawn_retention_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let sweeper = this.clone();
                if let Err(err) =
                    tokio::task::spawn_blocking(move || sweeper.sweep_expired(SystemTime::now()))
                        .await
                {
                    warn!(error = %err, "retention sweep task failed");
                }
            }
        })
    }
}

impl CleanupInner {
    fn expire(&self, key: &JobKey) -> bool {
        let removed = self.layout.remove(key);
        if self
            .store
            .get(key)
            .is_some_and(|status| status.state.is_terminal())
        {
            self.store.delete(key);
        }
        if removed {
            info!(%key, "deleted artifact");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{JobState, JobStatus};
    use crate::store::InMemoryJobStore;

    fn key(profile: Profile, id: &str) -> JobKey {
        JobKey::new(profile, JobIdentifier::parse(id).unwrap())
    }

    #[test]
    fn deterministic_paths() {
        let layout = ArtifactLayout::new("downloads");
        let key = key(Profile::YoutubeMp3, "ABC123");
        assert_eq!(layout.file_name(&key), "youtube_ABC123.mp3");
        assert_eq!(
            layout.path_for(&key),
            PathBuf::from("downloads/youtube_ABC123.mp3")
        );
        assert_eq!(layout.download_url(&key), "/downloads/youtube_ABC123.mp3");
    }

    #[test]
    fn file_names_parse_back() {
        let layout = ArtifactLayout::new("downloads");
        for profile in Profile::ALL {
            let original = key(profile, "a_b-c");
            let parsed = ArtifactLayout::parse_file_name(&layout.file_name(&original));
            assert_eq!(parsed, Some(original));
        }
        assert_eq!(ArtifactLayout::parse_file_name("youtube_ABC.flac"), None);
        assert_eq!(ArtifactLayout::parse_file_name("notes.txt"), None);
        assert_eq!(ArtifactLayout::parse_file_name("youtube_..mp3"), None);
    }

    #[test]
    fn place_moves_file_and_remove_deletes_it() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        layout.prepare().unwrap();
        let key = key(Profile::YoutubeMp3, "ABC123");
        let work = layout.work_dir(&key).unwrap();
        let produced = work.path().join("Song.mp3");
        fs::write(&produced, b"mp3").unwrap();

        let placed = layout.place(&produced, &key).unwrap();
        assert_eq!(placed, dir.path().join("youtube_ABC123.mp3"));
        assert!(!produced.exists());
        assert!(layout.exists(&key));

        assert!(layout.remove(&key));
        assert!(!layout.remove(&key));
        assert!(!layout.exists(&key));
    }

    #[test]
    fn display_filename_keeps_word_characters() {
        assert_eq!(
            display_filename("Rick Astley - Never Gonna (Official)", "x", "mp3"),
            "RickAstleyNeverGonnaOfficial.mp3"
        );
        assert_eq!(display_filename("!!!", "ABC123", "mp4"), "ABC123.mp4");
    }

    fn scheduler(dir: &Path, delay: Duration) -> (CleanupScheduler, Arc<InMemoryJobStore>) {
        let store = Arc::new(InMemoryJobStore::new());
        let layout = ArtifactLayout::new(dir);
        layout.prepare().unwrap();
        let scheduler = CleanupScheduler::new(layout, store.clone(), delay, delay * 4);
        (scheduler, store)
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_runs_once_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path(), Duration::from_secs(300));
        let key = key(Profile::YoutubeMp3, "ABC123");
        let path = dir.path().join("youtube_ABC123.mp3");
        fs::write(&path, b"mp3").unwrap();
        store.put(&key, JobStatus::complete("src", "Song.mp3"));

        let handle = scheduler.schedule(&key).unwrap();
        assert!(scheduler.schedule(&key).is_none());
        assert!(scheduler.is_scheduled(&key));

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(path.exists());

        handle.await.unwrap();
        assert!(!path.exists());
        assert!(store.get(&key).is_none());
        assert!(!scheduler.is_scheduled(&key));
    }

    #[test]
    fn scratch_entries_name_their_owner() {
        let layout = ArtifactLayout::new("downloads");
        let live = key(Profile::YoutubeMp3, "live");
        let upload = key(Profile::Wav, "0123abcd");
        let work = format!("{}.Ab12Cd", layout.file_name(&live));
        let staged = format!("{}.Xy98Zw.mp3", layout.file_name(&upload));
        assert_eq!(ArtifactLayout::scratch_owner(&work), Some(live));
        assert_eq!(ArtifactLayout::scratch_owner(&staged), Some(upload));
        assert_eq!(ArtifactLayout::scratch_owner("random-dir"), None);
    }

    #[tokio::test]
    async fn sweep_keeps_scratch_space_of_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path(), Duration::from_secs(300));
        let layout = ArtifactLayout::new(dir.path());
        let live = key(Profile::YoutubeMp3, "live");
        assert!(store.try_claim(&live, JobStatus::processing("src")));
        let live_work = layout.work_dir(&live).unwrap();
        fs::write(live_work.path().join("live.webm.part"), b"partial").unwrap();
        let gone = key(Profile::YoutubeMp3, "gone");
        let gone_work = layout.work_dir(&gone).unwrap();

        let later = SystemTime::now() + Duration::from_secs(4 * 300 + 1);
        assert_eq!(scheduler.sweep_expired(later), 1);
        assert!(live_work.path().is_dir());
        assert!(!gone_work.path().exists());
        assert_eq!(store.get(&live).unwrap().state, JobState::Processing);
    }

    #[tokio::test]
    async fn sweep_forgets_stale_failed_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path(), Duration::from_secs(60));
        let failed = key(Profile::YoutubeMp3, "failed");
        let mut status = JobStatus::error("src", "boom");
        status.updated_at = Utc::now() - chrono::Duration::hours(1);
        store.put(&failed, status);
        let recent = key(Profile::YoutubeMp3, "recent");
        store.put(&recent, JobStatus::error("src", "boom"));

        scheduler.sweep_expired(SystemTime::now());
        assert!(store.get(&failed).is_none());
        assert!(store.get(&recent).is_some());
    }

    #[tokio::test]
    async fn retention_sweeper_runs_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _store) = scheduler(dir.path(), Duration::from_secs(60));
        let backdate = |path: &Path| {
            fs::write(path, b"mp3").unwrap();
            fs::File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(SystemTime::now() - Duration::from_secs(3600))
                .unwrap();
        };
        let wait_until_gone = |path: PathBuf| async move {
            for _ in 0..200 {
                if !path.exists() {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            false
        };

        let first = dir.path().join("youtube_first.mp3");
        backdate(&first);
        let sweeper = scheduler.spawn_retention_sweeper(Duration::from_millis(50));
        assert!(wait_until_gone(first).await);

        let second = dir.path().join("youtube_second.mp3");
        backdate(&second);
        assert!(wait_until_gone(second).await);
        sweeper.abort();
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path(), Duration::from_secs(60));
        let stale = key(Profile::YoutubeMp3, "old");
        fs::write(dir.path().join("youtube_old.mp3"), b"mp3").unwrap();
        fs::write(dir.path().join("readme.txt"), b"keep").unwrap();
        fs::create_dir_all(dir.path().join(".work/youtube-mp3-old-x")).unwrap();
        store.put(&stale, JobStatus::complete("src", "old.mp3"));

        assert_eq!(scheduler.sweep_expired(SystemTime::now()), 0);

        let later = SystemTime::now() + Duration::from_secs(3600);
        assert_eq!(scheduler.sweep_expired(later), 2);
        assert!(!dir.path().join("youtube_old.mp3").exists());
        assert!(!dir.path().join(".work/youtube-mp3-old-x").exists());
        assert!(dir.path().join("readme.txt").exists());
        assert!(store.get(&stale).is_none());
    }
}
