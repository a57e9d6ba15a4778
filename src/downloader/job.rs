// DownloadJob - resolve, fetch video, fetch audio, merge for one media item
//
// Overall progress bands: resolve 0%, each fetch 40%, merge 20%. A
// single combined stream owns the whole range. Retryable fetch errors are
// retried inside their phase; nothing that already succeeded is repeated.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::errors::JobError;
use super::extractors::CatalogSource;
use super::fetcher::{FetchRequest, StreamFetcher};
use super::format_selector::{FormatResolver, Selection};
use super::models::{FormatCatalog, ItemState, MediaItem, StreamVariant};
use super::muxer::MediaTool;
use super::progress::{CancelFlag, PhaseSpan, Reporter};
use super::utils::{item_file_name, remove_artifacts, safe_file_stem, temp_sibling, unique_id};

const FETCH_VIDEO: PhaseSpan = PhaseSpan::new(0.0, 0.4);
const FETCH_AUDIO: PhaseSpan = PhaseSpan::new(0.4, 0.4);
const MERGE: PhaseSpan = PhaseSpan::new(0.8, 0.2);
const FETCH_SINGLE: PhaseSpan = PhaseSpan::new(0.0, 1.0);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts per phase, including the first
    pub max_attempts: u32,
    /// Base delay, multiplied by the attempt number
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Collaborators shared by every DownloadJob of a run
pub struct DownloadServices {
    pub catalog: Arc<dyn CatalogSource>,
    pub fetcher: Arc<dyn StreamFetcher>,
    pub media: Arc<dyn MediaTool>,
    pub retry: RetryPolicy,
}

/// The job's state record.
///
/// Transitions read the cancellation flag while holding the state lock, so a
/// transition and a cancel request are never interleaved halfway.
#[derive(Debug)]
pub struct ItemControl {
    state: Mutex<ItemState>,
    cancel: CancelFlag,
}

impl ItemControl {
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            state: Mutex::new(ItemState::Pending),
            cancel,
        }
    }

    pub fn state(&self) -> ItemState {
        *self.state.lock()
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Move to a non-terminal phase; refused once cancelled or finished
    pub fn advance(&self, next: ItemState) -> Result<(), JobError> {
        let mut state = self.state.lock();
        if state.is_terminal() || self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        *state = next;
        Ok(())
    }

    /// Enter a terminal state; the first terminal state wins
    pub fn finish(&self, terminal: ItemState) -> ItemState {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = terminal;
        }
        *state
    }

    pub fn request_cancel(&self) {
        let state = self.state.lock();
        if !state.is_terminal() {
            self.cancel.cancel();
        }
    }
}

/// `{stem}.{tag}.{ext}` next to the final output
fn stream_path(destination: &Path, tag: &str, variant: &StreamVariant) -> PathBuf {
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let ext = if variant.ext.is_empty() { "bin" } else { variant.ext.as_str() };
    destination.with_file_name(format!("{}.{}.{}", stem, tag, ext))
}

pub struct DownloadJob {
    item: MediaItem,
    output_dir: PathBuf,
    services: Arc<DownloadServices>,
    control: ItemControl,
    /// Appended to the file name when another job may resolve to the same item
    copy_tag: Option<String>,
    /// Files this job may have created and must remove unless it completes
    artifacts: Vec<PathBuf>,
}

impl DownloadJob {
    pub fn new(
        item: MediaItem,
        output_dir: PathBuf,
        services: Arc<DownloadServices>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            item,
            output_dir,
            services,
            control: ItemControl::new(cancel),
            copy_tag: None,
            artifacts: Vec::new(),
        }
    }

    /// Name this job's files `{title} [{id}] ({tag})` so they cannot collide
    /// with another job downloading the same item
    pub fn with_copy_tag(mut self, tag: Option<String>) -> Self {
        self.copy_tag = tag;
        self
    }

    /// Drive the item to a terminal state.
    ///
    /// On failure or cancellation every temporary artifact is removed before
    /// this returns.
    pub async fn run(mut self, reporter: &dyn Reporter) -> Result<PathBuf, JobError> {
        let result = self.execute(reporter).await;

        let terminal = match &result {
            Ok(path) => {
                info!("[DownloadJob] complete: {}", path.display());
                reporter.progress(1.0);
                reporter.status("Download complete");
                ItemState::Complete
            }
            Err(e) => {
                remove_artifacts(&self.artifacts).await;
                if matches!(e, JobError::Cancelled) {
                    info!("[DownloadJob] cancelled: {}", self.item.source);
                    ItemState::Cancelled
                } else {
                    warn!("[DownloadJob] failed: {}: {}", self.item.source, e);
                    ItemState::Failed
                }
            }
        };

        let terminal = self.control.finish(terminal);
        reporter.state(terminal);
        result
    }

    fn enter(&self, state: ItemState, reporter: &dyn Reporter) -> Result<(), JobError> {
        self.control.advance(state)?;
        reporter.state(state);
        Ok(())
    }

    async fn execute(&mut self, reporter: &dyn Reporter) -> Result<PathBuf, JobError> {
        self.enter(ItemState::Resolving, reporter)?;
        reporter.progress(0.0);
        reporter.status("Analyzing video formats");

        let services = Arc::clone(&self.services);
        let source = self.item.source.clone();
        let catalog = self
            .with_retry("Format lookup", reporter, || services.catalog.fetch_catalog(&source))
            .await?;
        let selection = FormatResolver::resolve(&catalog)?;
        info!("[DownloadJob] '{}': {}", catalog.title, selection.describe());

        if self.item.title.is_none() {
            self.item.title = Some(catalog.title.clone());
        }
        self.item.duration = catalog.duration;

        tokio::fs::create_dir_all(&self.output_dir).await?;

        match selection {
            Selection::Split { video, audio } => {
                let destination = self.destination(&catalog, "mp4");
                let video_path = stream_path(&destination, "video", &video);
                let audio_path = stream_path(&destination, "audio", &audio);
                self.track(&video_path);
                self.track(&temp_sibling(&video_path, "part"));
                self.track(&audio_path);
                self.track(&temp_sibling(&audio_path, "part"));
                self.track(&temp_sibling(&destination, "muxing"));

                self.enter(ItemState::FetchingVideo, reporter)?;
                reporter.status(&format!(
                    "Downloading video stream ({})",
                    FormatResolver::video_label(&video)
                ));
                let video_file = self
                    .fetch_phase(&video, &video_path, FETCH_VIDEO, reporter)
                    .await?;

                self.enter(ItemState::FetchingAudio, reporter)?;
                reporter.status(&format!(
                    "Downloading audio stream ({})",
                    FormatResolver::audio_label(&audio)
                ));
                let audio_file = self
                    .fetch_phase(&audio, &audio_path, FETCH_AUDIO, reporter)
                    .await?;

                self.enter(ItemState::Merging, reporter)?;
                reporter.progress(MERGE.start);
                reporter.status("Merging video and audio");
                let on_progress = |f: f64| reporter.progress(MERGE.at(f));
                let merged = self
                    .services
                    .media
                    .merge(
                        &video_file,
                        &audio_file,
                        &destination,
                        catalog.duration,
                        &on_progress,
                        self.control.cancel_flag(),
                    )
                    .await?;

                remove_artifacts(&[video_file, audio_file]).await;
                Ok(merged)
            }
            Selection::Single(variant) => {
                let ext = if variant.ext.is_empty() { "mp4".to_string() } else { variant.ext.clone() };
                let destination = self.destination(&catalog, &ext);
                // the destination only appears through the final rename
                self.track(&temp_sibling(&destination, "part"));

                self.enter(ItemState::FetchingVideo, reporter)?;
                reporter.status(&format!(
                    "Downloading combined stream ({})",
                    FormatResolver::video_label(&variant)
                ));
                self.fetch_phase(&variant, &destination, FETCH_SINGLE, reporter)
                    .await
            }
        }
    }

    /// Explicit target, else `{title} [{id}].{ext}` in the output folder
    fn destination(&self, catalog: &FormatCatalog, ext: &str) -> PathBuf {
        if let Some(path) = &self.item.target_path {
            return path.clone();
        }
        let title = self.item.title.as_deref().unwrap_or(&catalog.title);
        let id = catalog
            .item_id
            .clone()
            .unwrap_or_else(|| unique_id(&self.item.source));
        let mut path = self.output_dir.join(item_file_name(title, &id));
        path.set_extension(ext);
        if let Some(tag) = &self.copy_tag {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            path.set_file_name(format!("{} ({}).{}", stem, safe_file_stem(tag), ext));
        }
        path
    }

    /// Only files this job writes itself; never the final destination
    fn track(&mut self, path: &Path) {
        self.artifacts.push(path.to_path_buf());
    }

    async fn fetch_phase(
        &self,
        variant: &StreamVariant,
        destination: &Path,
        span: PhaseSpan,
        reporter: &dyn Reporter,
    ) -> Result<PathBuf, JobError> {
        reporter.progress(span.start);
        let on_progress = |f: f64| reporter.progress(span.at(f));
        let fetcher = Arc::clone(&self.services.fetcher);
        let cancel = self.control.cancel_flag();
        let request = FetchRequest {
            source_url: &self.item.source,
            variant,
        };

        self.with_retry("Download", reporter, || {
            fetcher.fetch(request, destination, &on_progress, cancel)
        })
        .await
    }

    /// Retry retryable errors with linear backoff, honoring cancellation
    async fn with_retry<T, F, Fut>(
        &self,
        what: &str,
        reporter: &dyn Reporter,
        mut op: F,
    ) -> Result<T, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, JobError>>,
    {
        let policy = self.services.retry;
        let max_attempts = policy.max_attempts.max(1);
        let cancel = self.control.cancel_flag();
        let mut attempt = 1;

        loop {
            cancel.check()?;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        "[DownloadJob] {} attempt {}/{} failed: {}",
                        what, attempt, max_attempts, e
                    );
                    attempt += 1;
                    reporter.status(&format!(
                        "{} interrupted, retrying ({}/{})",
                        what, attempt, max_attempts
                    ));
                    sleep_or_cancel(policy.backoff * (attempt - 1), cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Sleep in short slices so a cancel request is noticed promptly
async fn sleep_or_cancel(total: Duration, cancel: &CancelFlag) -> Result<(), JobError> {
    let slice = Duration::from_millis(100);
    let mut remaining = total;
    while !remaining.is_zero() {
        cancel.check()?;
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
    cancel.check()
}
