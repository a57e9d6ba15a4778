// PlaylistCoordinator - one DownloadJob per playlist entry, failures isolated per entry

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use super::errors::{JobError, JobFailure};
use super::job::{DownloadJob, DownloadServices};
use super::models::{EntryUpdate, ItemState, PlaylistEntry};
use super::progress::{CancelFlag, Reporter};

/// Terminal result of one playlist entry
#[derive(Debug, Clone, Serialize)]
pub struct EntryOutcome {
    pub position: usize,
    pub source: String,
    pub title: Option<String>,
    pub state: ItemState,
    pub output_path: Option<PathBuf>,
    pub error: Option<JobFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistReport {
    pub title: Option<String>,
    /// One outcome per entry, in playlist order
    pub entries: Vec<EntryOutcome>,
}

impl PlaylistReport {
    pub fn succeeded(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == ItemState::Complete)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == ItemState::Failed)
            .count()
    }
}

/// Per-entry fractions folded into one overall playlist fraction
struct PlaylistProgress {
    fractions: Mutex<Vec<f64>>,
}

impl PlaylistProgress {
    fn new(len: usize) -> Self {
        Self {
            fractions: Mutex::new(vec![0.0; len]),
        }
    }

    /// Record an entry fraction and return the overall fraction
    fn update(&self, index: usize, fraction: f64) -> f64 {
        let mut fractions = self.fractions.lock();
        if let Some(slot) = fractions.get_mut(index) {
            if fraction > *slot {
                *slot = fraction.min(1.0);
            }
        }
        fractions.iter().sum::<f64>() / fractions.len().max(1) as f64
    }
}

/// Reporter handed to an entry's DownloadJob.
///
/// Job-level progress becomes entry progress plus overall playlist progress.
/// Terminal states are left to the coordinator, which attaches the failure.
struct EntryReporter<'a> {
    index: usize,
    position: usize,
    total: usize,
    title: Option<String>,
    state: Mutex<(ItemState, f64)>,
    parent: &'a dyn Reporter,
    overall: &'a PlaylistProgress,
}

impl<'a> EntryReporter<'a> {
    fn new(
        index: usize,
        entry: &PlaylistEntry,
        total: usize,
        parent: &'a dyn Reporter,
        overall: &'a PlaylistProgress,
    ) -> Self {
        Self {
            index,
            position: entry.position,
            total,
            title: entry.item.title.clone(),
            state: Mutex::new((ItemState::Pending, 0.0)),
            parent,
            overall,
        }
    }

    fn publish(&self, state: ItemState, progress: f64, error: Option<JobFailure>) {
        self.parent.entry(&EntryUpdate {
            position: self.position,
            title: self.title.clone(),
            state,
            progress,
            error,
        });
    }

    fn finish(&self, outcome: &EntryOutcome) {
        self.parent.progress(self.overall.update(self.index, 1.0));
        let progress = if outcome.state == ItemState::Complete { 1.0 } else { self.state.lock().1 };
        self.publish(outcome.state, progress, outcome.error.clone());
    }
}

impl Reporter for EntryReporter<'_> {
    fn progress(&self, fraction: f64) {
        let state = {
            let mut current = self.state.lock();
            if fraction <= current.1 {
                return;
            }
            current.1 = fraction;
            current.0
        };
        self.parent.progress(self.overall.update(self.index, fraction));
        self.publish(state, fraction, None);
    }

    fn status(&self, message: &str) {
        self.parent
            .status(&format!("[{}/{}] {}", self.position, self.total, message));
    }

    fn state(&self, state: ItemState) {
        if state.is_terminal() {
            return;
        }
        let progress = {
            let mut current = self.state.lock();
            current.0 = state;
            current.1
        };
        self.publish(state, progress, None);
    }
}

/// Repeats of an earlier source are tagged with their position so two jobs
/// never share a file
fn copy_tags(entries: &[PlaylistEntry]) -> Vec<Option<String>> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .map(|entry| {
            if seen.insert(entry.item.source.as_str()) {
                None
            } else {
                Some(entry.position.to_string())
            }
        })
        .collect()
}

pub struct PlaylistCoordinator {
    source: String,
    output_dir: PathBuf,
    services: Arc<DownloadServices>,
    concurrency: usize,
    cancel: CancelFlag,
}

impl PlaylistCoordinator {
    pub fn new(
        source: impl Into<String>,
        output_dir: PathBuf,
        services: Arc<DownloadServices>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            source: source.into(),
            output_dir,
            services,
            concurrency: 1,
            cancel,
        }
    }

    /// Entries in flight at once; 1 keeps strict playlist order
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Enumerate and download every entry.
    ///
    /// Entry failures are recorded in the report; only enumeration failure or
    /// cancellation fail the playlist as a whole.
    pub async fn run(self, reporter: &dyn Reporter) -> Result<PlaylistReport, JobError> {
        self.cancel.check()?;
        reporter.progress(0.0);
        reporter.status("Fetching playlist entries");

        let listing = self
            .services
            .catalog
            .enumerate_playlist(&self.source)
            .await
            .map_err(|e| match e {
                JobError::PlaylistEnumeration(_) | JobError::DependencyMissing(_) | JobError::Cancelled => e,
                other => JobError::PlaylistEnumeration(other.to_string()),
            })?;
        if listing.entries.is_empty() {
            return Err(JobError::PlaylistEnumeration(
                "Playlist has no downloadable entries".to_string(),
            ));
        }

        let total = listing.entries.len();
        info!(
            "[Playlist] {} entries in '{}'",
            total,
            listing.title.as_deref().unwrap_or(&self.source)
        );
        reporter.status(&format!("Found {} videos", total));

        let overall = PlaylistProgress::new(total);
        let entry_reporters: Vec<EntryReporter<'_>> = listing
            .entries
            .iter()
            .enumerate()
            .map(|(index, entry)| EntryReporter::new(index, entry, total, reporter, &overall))
            .collect();
        for entry_reporter in &entry_reporters {
            entry_reporter.publish(ItemState::Pending, 0.0, None);
        }

        let tags = copy_tags(&listing.entries);
        let runs: Vec<_> = listing
            .entries
            .iter()
            .zip(&entry_reporters)
            .zip(tags)
            .map(|((entry, entry_reporter), tag)| self.run_entry(entry, tag, entry_reporter))
            .collect();
        let entries: Vec<EntryOutcome> = stream::iter(runs)
            .buffered(self.concurrency)
            .collect()
            .await;

        self.cancel.check()?;

        let report = PlaylistReport {
            title: listing.title,
            entries,
        };
        reporter.status(&format!(
            "Playlist finished: {} downloaded, {} failed",
            report.succeeded(),
            report.failed()
        ));
        Ok(report)
    }

    async fn run_entry(
        &self,
        entry: &PlaylistEntry,
        copy_tag: Option<String>,
        reporter: &EntryReporter<'_>,
    ) -> EntryOutcome {
        let job = DownloadJob::new(
            entry.item.clone(),
            self.output_dir.clone(),
            Arc::clone(&self.services),
            self.cancel.clone(),
        )
        .with_copy_tag(copy_tag);
        let result = job.run(reporter).await;

        let outcome = match result {
            Ok(path) => EntryOutcome {
                position: entry.position,
                source: entry.item.source.clone(),
                title: entry.item.title.clone(),
                state: ItemState::Complete,
                output_path: Some(path),
                error: None,
            },
            Err(e) => {
                let state = if matches!(e, JobError::Cancelled) {
                    ItemState::Cancelled
                } else {
                    warn!("[Playlist] entry {} failed: {}", entry.position, e);
                    ItemState::Failed
                };
                EntryOutcome {
                    position: entry.position,
                    source: entry.item.source.clone(),
                    title: entry.item.title.clone(),
                    state,
                    output_path: None,
                    error: (state == ItemState::Failed).then(|| JobFailure::from(&e)),
                }
            }
        };
        reporter.finish(&outcome);
        outcome
    }
}
