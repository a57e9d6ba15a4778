// ClipJob - cut an ordered list of ranges out of one local source file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::errors::{JobError, JobFailure};
use super::models::{ClipRange, ClipResult, RangeRequest};
use super::muxer::{clamp_to_duration, MediaTool};
use super::progress::{CancelFlag, Reporter};
use super::utils::{clip_file_name, remove_artifacts, temp_sibling};

/// A requested range after eager validation
struct PlannedClip {
    index: usize,
    requested: RangeRequest,
    output_path: PathBuf,
    window: Result<ClipRange, JobError>,
    clamped: bool,
}

pub struct ClipJob {
    source: PathBuf,
    ranges: Vec<RangeRequest>,
    output_dir: PathBuf,
    media: Arc<dyn MediaTool>,
    delete_source: bool,
    cancel: CancelFlag,
}

impl ClipJob {
    pub fn new<R: Into<RangeRequest>>(
        source: PathBuf,
        ranges: impl IntoIterator<Item = R>,
        output_dir: PathBuf,
        media: Arc<dyn MediaTool>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            source,
            ranges: ranges.into_iter().map(Into::into).collect(),
            output_dir,
            media,
            delete_source: false,
            cancel,
        }
    }

    /// Remove the source once every range has a result
    pub fn with_delete_source(mut self, delete: bool) -> Self {
        self.delete_source = delete;
        self
    }

    /// Produce one result per requested range, in request order.
    ///
    /// Individual range failures are reported in their result. The job itself
    /// only fails on cancellation or when the output folder cannot be created.
    pub async fn run(self, reporter: &dyn Reporter) -> Result<Vec<ClipResult>, JobError> {
        self.cancel.check()?;
        reporter.progress(0.0);
        reporter.status("Reading source duration");

        let duration = match self.media.probe_duration(&self.source).await {
            Ok(d) => Ok(d),
            Err(JobError::Cancelled) => return Err(JobError::Cancelled),
            Err(e) => {
                warn!("[ClipJob] cannot probe {}: {}", self.source.display(), e);
                Err(e)
            }
        };

        let plan = self.plan(duration.as_ref());
        let total = plan.len();
        if plan.iter().any(|p| p.window.is_ok()) {
            tokio::fs::create_dir_all(&self.output_dir).await?;
        }

        let mut results = Vec::with_capacity(total);
        for (done, planned) in plan.into_iter().enumerate() {
            let result = self.cut(planned, done, total, reporter).await?;
            results.push(result);
            reporter.progress((done + 1) as f64 / total.max(1) as f64);
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        info!("[ClipJob] {}/{} clips written", succeeded, total);

        if self.delete_source {
            self.remove_source(reporter).await;
        }
        reporter.progress(1.0);
        reporter.status(&format!("Created {} of {} clips", succeeded, total));
        Ok(results)
    }

    /// Validate every range before any trimming starts
    fn plan(&self, duration: Result<&f64, &JobError>) -> Vec<PlannedClip> {
        let stem = self
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.ranges
            .iter()
            .enumerate()
            .map(|(i, requested)| {
                let index = i + 1;
                let mut clamped = false;
                let offsets = requested.offsets();
                let window = offsets.clone().and_then(|(start, end)| ClipRange::new(start, end));
                let window = window.and_then(|range| match duration {
                    Ok(&duration) => match clamp_to_duration(&range, duration) {
                        Some(window) => {
                            clamped = window != range;
                            Ok(window)
                        }
                        None => Err(JobError::InvalidRange(format!(
                            "clip {} starts at {:.3}s, past the end of the source ({:.3}s)",
                            index,
                            range.start(),
                            duration
                        ))),
                    },
                    Err(e) => Err(e.clone()),
                });
                let (name_start, name_end) = match (&window, offsets) {
                    (Ok(w), _) => (w.start(), w.end()),
                    (Err(_), Ok(offsets)) => offsets,
                    (Err(_), Err(_)) => (0.0, 0.0),
                };
                PlannedClip {
                    index,
                    requested: requested.clone(),
                    output_path: self
                        .output_dir
                        .join(clip_file_name(&stem, index, name_start, name_end)),
                    window,
                    clamped,
                }
            })
            .collect()
    }

    async fn cut(
        &self,
        planned: PlannedClip,
        done: usize,
        total: usize,
        reporter: &dyn Reporter,
    ) -> Result<ClipResult, JobError> {
        let PlannedClip {
            index,
            requested,
            output_path,
            window,
            clamped,
        } = planned;

        let window = match window {
            Ok(window) => window,
            Err(e) => {
                warn!("[ClipJob] clip {} skipped: {}", index, e);
                return Ok(ClipResult {
                    index,
                    requested,
                    range: None,
                    output_path,
                    success: false,
                    error: Some(JobFailure::from(e)),
                });
            }
        };

        self.cancel.check()?;
        let mut status = format!("Creating clip {}/{} ({})", index, total, window);
        if clamped {
            status.push_str(&format!(", end clamped to {:.3}s", window.end()));
        }
        reporter.status(&status);

        let on_progress = |f: f64| reporter.progress((done as f64 + f.clamp(0.0, 1.0)) / total as f64);
        let outcome = self
            .media
            .trim(&self.source, &window, &output_path, &on_progress, &self.cancel)
            .await;

        match outcome {
            Ok(path) => Ok(ClipResult {
                index,
                requested,
                range: Some(window),
                output_path: path,
                success: true,
                error: None,
            }),
            Err(e) => {
                remove_artifacts(&clip_artifacts(&output_path)).await;
                if matches!(e, JobError::Cancelled) {
                    return Err(e);
                }
                warn!("[ClipJob] clip {} failed: {}", index, e);
                Ok(ClipResult {
                    index,
                    requested,
                    range: Some(window),
                    output_path,
                    success: false,
                    error: Some(JobFailure::from(e)),
                })
            }
        }
    }

    async fn remove_source(&self, reporter: &dyn Reporter) {
        match tokio::fs::remove_file(&self.source).await {
            Ok(()) => {
                info!("[ClipJob] removed source {}", self.source.display());
                reporter.status("Source video cleaned up");
            }
            Err(e) => {
                warn!("[ClipJob] could not delete source {}: {}", self.source.display(), e);
                reporter.status(&format!("Could not delete source video: {}", e));
            }
        }
    }
}

fn clip_artifacts(output: &Path) -> Vec<PathBuf> {
    vec![output.to_path_buf(), temp_sibling(output, "trimming")]
}
