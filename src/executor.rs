// Background executor - runs jobs on tokio tasks and streams their events
//
// Every job gets its own task and its own ordered event channel. The sink
// guarantees non-decreasing progress and exactly one terminal event, after
// which nothing else is delivered.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::downloader::clip::ClipJob;
use crate::downloader::errors::{ErrorKind, JobError, JobFailure};
use crate::downloader::job::{DownloadJob, DownloadServices};
use crate::downloader::models::{ClipResult, EntryUpdate, MediaItem, RangeRequest};
use crate::downloader::playlist::{PlaylistCoordinator, PlaylistReport};
use crate::downloader::progress::{CancelFlag, Reporter};

/// Unique identifier for background jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal payload of a job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Downloaded(PathBuf),
    Playlist(PlaylistReport),
    Clips(Vec<ClipResult>),
    Failed(JobFailure),
    Cancelled,
}

impl JobOutcome {
    fn from_result<T>(result: Result<T, JobError>, success: impl FnOnce(T) -> Self) -> Self {
        match result {
            Ok(value) => success(value),
            Err(JobError::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed(e.into()),
        }
    }

    /// True for outcomes a caller should treat as a failed run
    pub fn is_failure(&self) -> bool {
        match self {
            Self::Downloaded(_) => false,
            Self::Playlist(report) => report.failed() > 0,
            Self::Clips(results) => results.iter().any(|r| !r.success),
            Self::Failed(_) | Self::Cancelled => true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Progress { fraction: f64 },
    Status { message: String },
    Entry(EntryUpdate),
    Terminal { outcome: JobOutcome },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Terminal { .. })
    }
}

struct SinkState {
    last_progress: Option<f64>,
    closed: bool,
}

/// Per-job event channel writer.
///
/// Sends happen under the state lock, so events leave in the order they were
/// accepted and a terminal event is always the last one.
pub struct EventSink {
    job_id: JobId,
    tx: mpsc::UnboundedSender<JobEvent>,
    state: Mutex<SinkState>,
}

impl EventSink {
    fn new(job_id: JobId, tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self {
            job_id,
            tx,
            state: Mutex::new(SinkState {
                last_progress: None,
                closed: false,
            }),
        }
    }

    fn send(&self, kind: EventKind) {
        // a dropped receiver only means nobody is listening any more
        let _ = self.tx.send(JobEvent {
            job_id: self.job_id,
            kind,
        });
    }

    /// Deliver the terminal event; later calls are ignored
    pub fn finish(&self, outcome: JobOutcome) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        self.send(EventKind::Terminal { outcome });
        true
    }
}

impl Reporter for EventSink {
    fn progress(&self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        let mut state = self.state.lock();
        if state.closed || state.last_progress.map_or(false, |last| fraction <= last) {
            return;
        }
        state.last_progress = Some(fraction);
        self.send(EventKind::Progress { fraction });
    }

    fn status(&self, message: &str) {
        let state = self.state.lock();
        if state.closed {
            return;
        }
        debug!("[Job {}] {}", self.job_id, message);
        self.send(EventKind::Status {
            message: message.to_string(),
        });
    }

    fn entry(&self, update: &EntryUpdate) {
        let state = self.state.lock();
        if state.closed {
            return;
        }
        self.send(EventKind::Entry(update.clone()));
    }
}

/// Caller side of a running job
pub struct JobHandle {
    id: JobId,
    cancel: CancelFlag,
    events: mpsc::UnboundedReceiver<JobEvent>,
    task: JoinHandle<()>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        info!("[Executor] cancel requested for job {}", self.id);
        self.cancel.cancel();
    }

    /// A flag that cancels this job, for use from other tasks
    pub fn canceller(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Next event in job order; `None` once the job is finished and drained
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Drain events until the terminal one and return its outcome
    pub async fn wait(mut self) -> JobOutcome {
        while let Some(event) = self.events.recv().await {
            if let EventKind::Terminal { outcome } = event.kind {
                return outcome;
            }
        }
        // the supervisor always sends a terminal event; only an aborted runtime gets here
        let _ = (&mut self.task).await;
        JobOutcome::Failed(JobFailure {
            kind: ErrorKind::Io,
            message: "Job ended without a result".to_string(),
            detail: None,
        })
    }
}

/// Runs DownloadJob, PlaylistCoordinator and ClipJob off the caller's task
pub struct BackgroundExecutor {
    services: Arc<DownloadServices>,
    playlist_concurrency: usize,
}

impl BackgroundExecutor {
    pub fn new(services: Arc<DownloadServices>) -> Self {
        Self {
            services,
            playlist_concurrency: 1,
        }
    }

    pub fn with_playlist_concurrency(mut self, concurrency: usize) -> Self {
        self.playlist_concurrency = concurrency.max(1);
        self
    }

    pub fn spawn_download(&self, source: impl Into<String>, output_dir: PathBuf) -> JobHandle {
        let services = Arc::clone(&self.services);
        let item = MediaItem::new(source);
        self.spawn("download", move |sink, cancel| async move {
            let job = DownloadJob::new(item, output_dir, services, cancel);
            JobOutcome::from_result(job.run(&*sink).await, JobOutcome::Downloaded)
        })
    }

    pub fn spawn_playlist(&self, source: impl Into<String>, output_dir: PathBuf) -> JobHandle {
        let services = Arc::clone(&self.services);
        let source = source.into();
        let concurrency = self.playlist_concurrency;
        self.spawn("playlist", move |sink, cancel| async move {
            let coordinator = PlaylistCoordinator::new(source, output_dir, services, cancel)
                .with_concurrency(concurrency);
            JobOutcome::from_result(coordinator.run(&*sink).await, JobOutcome::Playlist)
        })
    }

    pub fn spawn_clips<R: Into<RangeRequest>>(
        &self,
        source: PathBuf,
        ranges: impl IntoIterator<Item = R>,
        output_dir: PathBuf,
        delete_source: bool,
    ) -> JobHandle {
        let ranges: Vec<RangeRequest> = ranges.into_iter().map(Into::into).collect();
        let media = Arc::clone(&self.services.media);
        self.spawn("clip", move |sink, cancel| async move {
            let job = ClipJob::new(source, ranges, output_dir, media, cancel)
                .with_delete_source(delete_source);
            JobOutcome::from_result(job.run(&*sink).await, JobOutcome::Clips)
        })
    }

    /// Start `work` on its own task with a fresh id, channel and cancel flag.
    ///
    /// A supervisor task turns the work's result, or its panic, into the one
    /// terminal event.
    fn spawn<F, Fut>(&self, label: &'static str, work: F) -> JobHandle
    where
        F: FnOnce(Arc<EventSink>, CancelFlag) -> Fut,
        Fut: Future<Output = JobOutcome> + Send + 'static,
    {
        let id = JobId::new();
        let cancel = CancelFlag::new();
        let (tx, events) = mpsc::unbounded_channel();
        let sink = Arc::new(EventSink::new(id, tx));

        info!("[Executor] starting {} job {}", label, id);
        let worker = tokio::spawn(work(Arc::clone(&sink), cancel.clone()));
        let task = tokio::spawn(async move {
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("[Executor] {} job {} crashed: {}", label, id, e);
                    JobOutcome::Failed(JobFailure {
                        kind: ErrorKind::Io,
                        message: format!("Background task failed: {}", e),
                        detail: None,
                    })
                }
            };
            info!("[Executor] {} job {} finished", label, id);
            sink.finish(outcome);
        });

        JobHandle {
            id,
            cancel,
            events,
            task,
        }
    }
}
