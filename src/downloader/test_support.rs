// In-process doubles for the catalog, fetch and media seams

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::errors::{ErrorKind, JobError};
use super::extractors::{CatalogSource, PlaylistListing};
use super::fetcher::{FetchRequest, ProgressFn, StreamFetcher};
use super::models::{
    ClipRange, EntryUpdate, FormatCatalog, ItemState, MediaItem, MediaKind, PlaylistEntry,
    StreamVariant,
};
use super::muxer::MediaTool;
use super::progress::{CancelFlag, Reporter};
use super::utils::temp_sibling;

fn variant(id: &str, kind: MediaKind) -> StreamVariant {
    StreamVariant {
        id: id.to_string(),
        kind,
        ext: "mp4".to_string(),
        vcodec: None,
        acodec: None,
        width: None,
        height: None,
        tbr: None,
        abr: None,
        filesize: None,
        filesize_approx: None,
        url: None,
        protocol: None,
        http_headers: BTreeMap::new(),
    }
}

pub fn video_variant(id: &str, height: u32, vcodec: &str) -> StreamVariant {
    let mut v = variant(id, MediaKind::VideoOnly);
    v.vcodec = Some(vcodec.to_string());
    v.acodec = Some("none".to_string());
    v.width = Some(height * 16 / 9);
    v.height = Some(height);
    v.tbr = Some(height as f32 * 2.0);
    v.filesize = Some(height as u64 * 1000);
    v
}

pub fn audio_variant(id: &str, kbps: f32, acodec: &str) -> StreamVariant {
    let mut v = variant(id, MediaKind::AudioOnly);
    v.ext = "m4a".to_string();
    v.vcodec = Some("none".to_string());
    v.acodec = Some(acodec.to_string());
    v.abr = Some(kbps);
    v.tbr = Some(kbps);
    v.filesize = Some(kbps as u64 * 1000);
    v
}

pub fn combined_variant(id: &str, height: u32) -> StreamVariant {
    let mut v = variant(id, MediaKind::Combined);
    v.vcodec = Some("avc1.42001E".to_string());
    v.acodec = Some("mp4a.40.2".to_string());
    v.width = Some(height * 16 / 9);
    v.height = Some(height);
    v.tbr = Some(height as f32 * 2.0);
    v.abr = Some(96.0);
    v.filesize = Some(height as u64 * 1000);
    v
}

pub fn catalog(variants: Vec<StreamVariant>) -> FormatCatalog {
    FormatCatalog {
        item_id: None,
        title: "Test Video".to_string(),
        duration: Some(600.0),
        webpage_url: None,
        variants,
    }
}

/// A catalog with one 720p video and one AAC audio stream
pub fn split_catalog() -> FormatCatalog {
    catalog(vec![
        video_variant("136", 720, "avc1.4d401f"),
        audio_variant("140", 128.0, "mp4a.40.2"),
    ])
}

pub fn error_of(kind: ErrorKind) -> JobError {
    match kind {
        ErrorKind::NoCompatibleFormat => JobError::NoCompatibleFormat("no formats".into()),
        ErrorKind::NetworkError => JobError::network("connection reset"),
        ErrorKind::QuotaOrAccessError => JobError::QuotaOrAccess {
            message: "HTTP 403".into(),
            detail: None,
        },
        ErrorKind::IncompleteTransfer => JobError::IncompleteTransfer {
            received: 10,
            expected: 100,
        },
        ErrorKind::MuxError => JobError::mux("ffmpeg exited with status 1", "boom"),
        ErrorKind::PlaylistEnumerationError => JobError::PlaylistEnumeration("empty".into()),
        ErrorKind::DependencyMissing => JobError::DependencyMissing("ffmpeg".into()),
        ErrorKind::InvalidRange => JobError::InvalidRange("bad".into()),
        ErrorKind::Cancelled => JobError::Cancelled,
        ErrorKind::Io => JobError::Io("disk full".into()),
    }
}

/// Sorted file names in `dir`
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Executable `#!/bin/sh` script standing in for an external tool
#[cfg(unix)]
pub fn stub_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn write_via_temp(destination: &Path, tag: &str, bytes: &[u8]) -> Result<PathBuf, JobError> {
    let temp = temp_sibling(destination, tag);
    tokio::fs::write(&temp, bytes).await?;
    tokio::fs::rename(&temp, destination).await?;
    Ok(destination.to_path_buf())
}

async fn block_until_cancelled(cancel: &CancelFlag) -> JobError {
    while !cancel.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    JobError::Cancelled
}

/// Catalog lookups answered from memory.
///
/// URLs without an explicit answer get the default catalog, if any.
#[derive(Default)]
pub struct FakeCatalog {
    default: Option<FormatCatalog>,
    answers: HashMap<String, Result<FormatCatalog, JobError>>,
    playlist: Option<Result<PlaylistListing, JobError>>,
}

impl FakeCatalog {
    pub fn single(catalog: FormatCatalog) -> Self {
        Self {
            default: Some(catalog),
            ..Default::default()
        }
    }

    pub fn failing(mut self, url: &str, kind: ErrorKind) -> Self {
        self.answers.insert(url.to_string(), Err(error_of(kind)));
        self
    }

    pub fn with_playlist(self, urls: &[&str]) -> Self {
        let titles: Vec<String> = (1..=urls.len()).map(|n| format!("Entry {}", n)).collect();
        let titled: Vec<(&str, &str)> = urls
            .iter()
            .zip(&titles)
            .map(|(url, title)| (*url, title.as_str()))
            .collect();
        self.with_titled_playlist(&titled)
    }

    pub fn with_titled_playlist(mut self, entries: &[(&str, &str)]) -> Self {
        let entries = entries
            .iter()
            .enumerate()
            .map(|(i, (url, title))| PlaylistEntry {
                position: i + 1,
                item: MediaItem::new(*url).with_title(Some(title.to_string())),
            })
            .collect();
        self.playlist = Some(Ok(PlaylistListing {
            title: Some("Test Playlist".to_string()),
            entries,
        }));
        self
    }

    pub fn with_playlist_error(mut self, error: JobError) -> Self {
        self.playlist = Some(Err(error));
        self
    }
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn fetch_catalog(&self, url: &str) -> Result<FormatCatalog, JobError> {
        match (self.answers.get(url), &self.default) {
            (Some(answer), _) => answer.clone(),
            (None, Some(default)) => Ok(default.clone()),
            (None, None) => Err(JobError::QuotaOrAccess {
                message: format!("unknown url {}", url),
                detail: None,
            }),
        }
    }

    async fn enumerate_playlist(&self, _url: &str) -> Result<PlaylistListing, JobError> {
        match &self.playlist {
            Some(listing) => listing.clone(),
            None => Err(JobError::PlaylistEnumeration("not a playlist".into())),
        }
    }
}

/// How the fake fetcher treats one variant id
#[derive(Debug, Clone, Copy)]
pub enum FetchScript {
    /// Fail the first n attempts with the given kind, then succeed
    FailTimes(u32, ErrorKind),
    /// Leave a partial temp file and wait for cancellation
    BlockUntilCancelled,
}

#[derive(Default)]
struct FetchState {
    scripts: HashMap<String, FetchScript>,
    attempts: HashMap<String, u32>,
    fetched: Vec<String>,
}

/// Writes a few bytes per variant; scripted failures per variant id
#[derive(Clone, Default)]
pub struct FakeFetcher {
    state: Arc<Mutex<FetchState>>,
    delay: Duration,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, variant_id: &str, script: FetchScript) -> Self {
        self.state
            .lock()
            .scripts
            .insert(variant_id.to_string(), script);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self, variant_id: &str) -> u32 {
        self.state
            .lock()
            .attempts
            .get(variant_id)
            .copied()
            .unwrap_or(0)
    }

    /// Variant ids fetched successfully, in order
    pub fn fetched_ids(&self) -> Vec<String> {
        self.state.lock().fetched.clone()
    }
}

#[async_trait]
impl StreamFetcher for FakeFetcher {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn fetch(
        &self,
        request: FetchRequest<'_>,
        destination: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError> {
        cancel.check()?;
        let id = request.variant.id.clone();
        let (attempt, script) = {
            let mut state = self.state.lock();
            let attempt = state.attempts.entry(id.clone()).or_insert(0);
            *attempt += 1;
            (*attempt, state.scripts.get(&id).copied())
        };

        match script {
            Some(FetchScript::FailTimes(n, kind)) if attempt <= n => return Err(error_of(kind)),
            Some(FetchScript::BlockUntilCancelled) => {
                tokio::fs::write(temp_sibling(destination, "part"), b"partial").await?;
                on_progress(0.25);
                return Err(block_until_cancelled(cancel).await);
            }
            _ => {}
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        on_progress(0.5);
        let path = write_via_temp(destination, "part", id.as_bytes()).await?;
        on_progress(1.0);
        self.state.lock().fetched.push(id);
        Ok(path)
    }
}

#[derive(Default)]
struct MediaState {
    merges: u32,
    trims: Vec<ClipRange>,
}

/// Merge/trim by writing small files; probe returns a fixed duration
#[derive(Clone)]
pub struct FakeMedia {
    duration: Option<f64>,
    fail_merge: bool,
    block_merge: bool,
    fail_trim_start: Option<f64>,
    block_trims: bool,
    state: Arc<Mutex<MediaState>>,
}

impl FakeMedia {
    pub fn new(duration: f64) -> Self {
        Self {
            duration: Some(duration),
            fail_merge: false,
            block_merge: false,
            fail_trim_start: None,
            block_trims: false,
            state: Arc::default(),
        }
    }

    /// Probing fails with a mux error
    pub fn unprobeable() -> Self {
        Self {
            duration: None,
            ..Self::new(0.0)
        }
    }

    pub fn failing_merge(mut self) -> Self {
        self.fail_merge = true;
        self
    }

    /// Merge leaves a half-written temp file and waits for cancellation
    pub fn blocking_merge(mut self) -> Self {
        self.block_merge = true;
        self
    }

    pub fn failing_trim_at(mut self, start: f64) -> Self {
        self.fail_trim_start = Some(start);
        self
    }

    pub fn blocking_trims(mut self) -> Self {
        self.block_trims = true;
        self
    }

    pub fn merge_calls(&self) -> u32 {
        self.state.lock().merges
    }

    /// Ranges actually handed to trim, in call order
    pub fn trimmed(&self) -> Vec<ClipRange> {
        self.state.lock().trims.clone()
    }
}

#[async_trait]
impl MediaTool for FakeMedia {
    async fn merge(
        &self,
        _video: &Path,
        _audio: &Path,
        output: &Path,
        _duration_hint: Option<f64>,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError> {
        cancel.check()?;
        self.state.lock().merges += 1;
        if self.fail_merge {
            tokio::fs::write(temp_sibling(output, "muxing"), b"half").await?;
            return Err(JobError::mux("ffmpeg exited with status 1", "Invalid data"));
        }
        if self.block_merge {
            tokio::fs::write(temp_sibling(output, "muxing"), b"half").await?;
            on_progress(0.3);
            return Err(block_until_cancelled(cancel).await);
        }
        let path = write_via_temp(output, "muxing", b"merged").await?;
        on_progress(1.0);
        Ok(path)
    }

    async fn trim(
        &self,
        _source: &Path,
        range: &ClipRange,
        output: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError> {
        cancel.check()?;
        self.state.lock().trims.push(*range);
        if self.block_trims {
            tokio::fs::write(temp_sibling(output, "trimming"), b"half").await?;
            return Err(block_until_cancelled(cancel).await);
        }
        if self.fail_trim_start == Some(range.start()) {
            return Err(JobError::mux("ffmpeg exited with status 1", "Conversion failed!"));
        }
        on_progress(0.5);
        let path = write_via_temp(output, "trimming", b"clip").await?;
        on_progress(1.0);
        Ok(path)
    }

    async fn probe_duration(&self, _source: &Path) -> Result<f64, JobError> {
        self.duration
            .ok_or_else(|| JobError::mux("ffprobe could not read the duration", "moov atom not found"))
    }
}

/// Records everything a job reports
#[derive(Default)]
pub struct RecordingReporter {
    progress: Mutex<Vec<f64>>,
    statuses: Mutex<Vec<String>>,
    states: Mutex<Vec<ItemState>>,
    entries: Mutex<Vec<EntryUpdate>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<ItemState> {
        self.states.lock().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().clone()
    }

    pub fn entries(&self) -> Vec<EntryUpdate> {
        self.entries.lock().clone()
    }

    pub fn last_progress(&self) -> Option<f64> {
        self.progress.lock().last().copied()
    }

    pub fn assert_monotonic(&self) {
        let progress = self.progress.lock();
        for pair in progress.windows(2) {
            assert!(
                pair[0] <= pair[1],
                "progress went backwards: {:?}",
                *progress
            );
        }
    }
}

impl Reporter for RecordingReporter {
    fn progress(&self, fraction: f64) {
        self.progress.lock().push(fraction);
    }

    fn status(&self, message: &str) {
        self.statuses.lock().push(message.to_string());
    }

    fn state(&self, state: ItemState) {
        self.states.lock().push(state);
    }

    fn entry(&self, update: &EntryUpdate) {
        self.entries.lock().push(update.clone());
    }
}
