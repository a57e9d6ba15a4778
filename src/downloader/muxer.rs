// Muxer - merge and trim through ffmpeg, duration probes through ffprobe
//
// Each call is one bounded ffmpeg process writing to a temp sibling of the
// output; the rename happens only after ffmpeg exits cleanly with a non-empty
// file. A semaphore caps how many ffmpeg processes run at once.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use super::errors::JobError;
use super::fetcher::ProgressFn;
use super::models::ClipRange;
use super::progress::{CancelFlag, ProgressNormalizer};
use super::utils::{non_empty_file_size, remove_artifacts, run_output_with_timeout, spawn_error, temp_sibling};

const PROBE_TIMEOUT_SECS: u64 = 60;

#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Copy the video bitstream, transcode audio to AAC, mux into one file.
    async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        duration_hint: Option<f64>,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError>;

    /// Re-encode [start, end) of `source` into `output`.
    async fn trim(
        &self,
        source: &Path,
        range: &ClipRange,
        output: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError>;

    /// Container duration in seconds
    async fn probe_duration(&self, source: &Path) -> Result<f64, JobError>;
}

/// Fit a range into a source of known duration.
///
/// The end is clamped to the duration; `None` when the range starts at or
/// after the end of the source.
pub fn clamp_to_duration(range: &ClipRange, duration: f64) -> Option<ClipRange> {
    if !duration.is_finite() || range.start() >= duration {
        return None;
    }
    ClipRange::new(range.start(), range.end().min(duration)).ok()
}

/// Seconds of output written so far, from `-progress` key/value lines
fn parse_out_time(line: &str) -> Option<f64> {
    lazy_static! {
        // out_time_ms is also microseconds, an old ffmpeg naming slip
        static ref OUT_TIME_RE: Regex = Regex::new(r"^out_time_(?:us|ms)=(\d+)$").unwrap();
    }
    let caps = OUT_TIME_RE.captures(line.trim())?;
    let micros: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(micros / 1_000_000.0)
}

fn secs_arg(value: f64) -> String {
    format!("{:.3}", value)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn merge_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        path_arg(video),
        "-i".to_string(),
        path_arg(audio),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "1:a:0".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-shortest".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        path_arg(output),
    ]
}

/// Input seeking plus a full re-encode keeps both boundaries frame accurate.
pub fn trim_args(source: &Path, range: &ClipRange, output: &Path) -> Vec<String> {
    vec![
        "-ss".to_string(),
        secs_arg(range.start()),
        "-i".to_string(),
        path_arg(source),
        "-t".to_string(),
        secs_arg(range.duration()),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "medium".to_string(),
        "-crf".to_string(),
        "23".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "128k".to_string(),
        "-avoid_negative_ts".to_string(),
        "make_zero".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        path_arg(output),
    ]
}

enum ToolExit {
    Finished(std::process::ExitStatus),
    Cancelled,
}

pub struct FfmpegTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    permits: Arc<Semaphore>,
    progress_interval: Duration,
    poll_interval: Duration,
}

impl FfmpegTool {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf, max_processes: usize) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            permits: Arc::new(Semaphore::new(max_processes.max(1))),
            progress_interval: Duration::from_millis(250),
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_intervals(mut self, progress: Duration, poll: Duration) -> Self {
        self.progress_interval = progress;
        self.poll_interval = poll.max(Duration::from_millis(10));
        self
    }

    /// Wait for a process slot without ignoring cancellation
    async fn acquire(&self, cancel: &CancelFlag) -> Result<SemaphorePermit<'_>, JobError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        let acquire = self.permits.acquire();
        tokio::pin!(acquire);
        loop {
            tokio::select! {
                permit = &mut acquire => {
                    return permit.map_err(|_| JobError::mux("media tool pool closed", ""));
                }
                _ = ticker.tick() => cancel.check()?,
            }
        }
    }

    /// Run ffmpeg to completion; `expected_secs` turns out_time into a fraction
    async fn run_ffmpeg(
        &self,
        body: Vec<String>,
        expected_secs: Option<f64>,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<(), JobError> {
        let _permit = self.acquire(cancel).await?;
        cancel.check()?;

        let mut args: Vec<String> = [
            "-hide_banner",
            "-nostdin",
            "-loglevel",
            "error",
            "-progress",
            "pipe:1",
            "-nostats",
            "-y",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(body);
        debug!("[Ffmpeg] {} {}", self.ffmpeg.display(), args.join(" "));

        let mut child = TokioCommand::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.ffmpeg, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::Io("Failed to capture ffmpeg stdout".to_string()))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| JobError::Io("Failed to capture ffmpeg stderr".to_string()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut normalizer = ProgressNormalizer::new(self.progress_interval);
        let mut handle_line = |line: &str| {
            if let (Some(done), Some(total)) = (parse_out_time(line), expected_secs) {
                if total > 0.0 {
                    if let Some(f) = normalizer.observe(done / total) {
                        on_progress(f);
                    }
                }
            }
        };

        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut stdout_open = true;
        let exit = loop {
            tokio::select! {
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => handle_line(&line),
                    _ => stdout_open = false,
                },
                status = child.wait() => break ToolExit::Finished(status?),
                _ = ticker.tick() => {
                    if cancel.is_cancelled() {
                        break ToolExit::Cancelled;
                    }
                }
            }
        };

        let status = match exit {
            ToolExit::Cancelled => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(JobError::Cancelled);
            }
            ToolExit::Finished(status) => status,
        };
        while let Ok(Some(line)) = lines.next_line().await {
            handle_line(&line);
        }
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            warn!("[Ffmpeg] exited with {}", status);
            return Err(JobError::mux(format!("ffmpeg exited with {}", status), &stderr));
        }
        if let Some(f) = normalizer.finish() {
            on_progress(f);
        }
        Ok(())
    }

    /// Run, verify a non-empty output, then move it into place
    async fn produce(
        &self,
        body: Vec<String>,
        temp: &Path,
        output: &Path,
        expected_secs: Option<f64>,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError> {
        let result = async {
            self.run_ffmpeg(body, expected_secs, on_progress, cancel).await?;
            if non_empty_file_size(temp).await.is_none() {
                return Err(JobError::mux("ffmpeg produced no output file", ""));
            }
            tokio::fs::rename(temp, output).await?;
            Ok::<PathBuf, JobError>(output.to_path_buf())
        }
        .await;

        if result.is_err() {
            remove_artifacts(&[temp.to_path_buf()]).await;
        }
        result
    }
}

#[async_trait]
impl MediaTool for FfmpegTool {
    async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        duration_hint: Option<f64>,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError> {
        let temp = temp_sibling(output, "muxing");
        let body = merge_args(video, audio, &temp);
        let merged = self
            .produce(body, &temp, output, duration_hint, on_progress, cancel)
            .await?;
        info!("[Ffmpeg] merged {}", merged.display());
        Ok(merged)
    }

    async fn trim(
        &self,
        source: &Path,
        range: &ClipRange,
        output: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError> {
        let duration = self.probe_duration(source).await?;
        let window = clamp_to_duration(range, duration).ok_or_else(|| {
            JobError::mux(
                format!(
                    "clip starts at {:.3}s but the source is {:.3}s long",
                    range.start(),
                    duration
                ),
                "",
            )
        })?;

        let temp = temp_sibling(output, "trimming");
        let body = trim_args(source, &window, &temp);
        let clip = self
            .produce(body, &temp, output, Some(window.duration()), on_progress, cancel)
            .await?;
        info!("[Ffmpeg] clip {} -> {}", window, clip.display());
        Ok(clip)
    }

    async fn probe_duration(&self, source: &Path) -> Result<f64, JobError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            path_arg(source),
        ];
        let out = run_output_with_timeout(&self.ffprobe, args, PROBE_TIMEOUT_SECS).await?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !out.status.success() {
            return Err(JobError::mux(
                format!("cannot read {}", source.display()),
                &stderr,
            ));
        }

        String::from_utf8_lossy(&out.stdout)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite() && *d > 0.0)
            .ok_or_else(|| {
                JobError::mux(
                    format!("{} reports no duration", source.display()),
                    &stderr,
                )
            })
    }
}
