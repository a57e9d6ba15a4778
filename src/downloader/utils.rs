// Helpers shared by the catalog, fetch, mux and clip stages

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::{timeout, Duration as TokioDuration};

use super::errors::JobError;

/// Longest stem kept by [`safe_file_stem`]
const MAX_STEM_CHARS: usize = 50;

/// Run command with timeout (shared utility)
pub async fn run_output_with_timeout(
    program: &Path,
    args: Vec<String>,
    timeout_secs: u64,
) -> Result<std::process::Output, JobError> {
    let mut child = TokioCommand::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| JobError::Io(format!("Failed to capture stdout from {}", program.display())))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| JobError::Io(format!("Failed to capture stderr from {}", program.display())))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });

    let waited = timeout(TokioDuration::from_secs(timeout_secs), child.wait()).await;
    match waited {
        Ok(status_res) => {
            let status = status_res?;
            let stdout = join_pipe(stdout_task).await?;
            let stderr = join_pipe(stderr_task).await?;
            Ok(std::process::Output { status, stdout, stderr })
        }
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(JobError::Network {
                message: format!("Timed out after {}s", timeout_secs),
                detail: Some(program.display().to_string()),
            })
        }
    }
}

async fn join_pipe(
    task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<Vec<u8>, JobError> {
    task.await
        .map_err(|e| JobError::Io(format!("pipe reader failed: {}", e)))?
        .map_err(JobError::from)
}

/// A tool that cannot be started is a missing dependency, not a job failure.
pub fn spawn_error(program: &Path, e: std::io::Error) -> JobError {
    if e.kind() == IoErrorKind::NotFound {
        JobError::DependencyMissing(program.display().to_string())
    } else {
        JobError::Io(format!("Failed to start {}: {}", program.display(), e))
    }
}

/// Keep alphanumerics, space, `-`, `_` and `.`; cap the length.
pub fn safe_file_stem(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
        .collect();
    let capped: String = kept.trim().chars().take(MAX_STEM_CHARS).collect();
    let capped = capped.trim().trim_start_matches('.').to_string();
    if capped.is_empty() {
        "video".to_string()
    } else {
        capped
    }
}

/// Short stable id for a source reference (FNV-1a, base36)
pub fn unique_id(source: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in source.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    to_base36(hash)
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// `{title} [{id}].mp4` - distinct items never share a destination
pub fn item_file_name(title: &str, item_id: &str) -> String {
    format!("{} [{}].mp4", safe_file_stem(title), safe_file_stem(item_id))
}

/// `{stem}_clip_{n}_{HH-MM-SS}-{HH-MM-SS}.mp4`
pub fn clip_file_name(source_stem: &str, index: usize, start: f64, end: f64) -> String {
    format!(
        "{}_clip_{}_{}-{}.mp4",
        safe_file_stem(source_stem),
        index,
        format_clock(start, '-'),
        format_clock(end, '-')
    )
}

/// Whole-second clock, e.g. `01-02-03`
pub fn format_clock(seconds: f64, sep: char) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    format!(
        "{:02}{sep}{:02}{sep}{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60,
        sep = sep
    )
}

/// Parse `HH:MM:SS`, `MM:SS` or `SS` (fraction allowed in the last field)
pub fn parse_timestamp(input: &str) -> Result<f64, JobError> {
    let invalid = || JobError::InvalidRange(format!("'{}' is not a timestamp", input.trim()));

    let parts: Vec<&str> = input.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.trim().is_empty()) {
        return Err(invalid());
    }

    let (last, leading) = parts.split_last().ok_or_else(invalid)?;
    let seconds: f64 = last.trim().parse().map_err(|_| invalid())?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(invalid());
    }

    let mut total = 0.0;
    for part in leading {
        let value: u64 = part.trim().parse().map_err(|_| invalid())?;
        total = total * 60.0 + value as f64;
    }

    Ok(total * 60.0 + seconds)
}

/// Parse `START-END`, each side a timestamp
pub fn parse_range(input: &str) -> Result<(f64, f64), JobError> {
    let (start, end) = input
        .split_once('-')
        .ok_or_else(|| JobError::InvalidRange(format!("'{}' is not START-END", input)))?;
    Ok((parse_timestamp(start)?, parse_timestamp(end)?))
}

/// Sibling path that keeps the extension: `a/b.mp4` + `part` -> `a/b.part.mp4`
pub fn temp_sibling(path: &Path, tag: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = match path.extension() {
        Some(ext) => format!("{}.{}.{}", stem, tag, ext.to_string_lossy()),
        None => format!("{}.{}", stem, tag),
    };
    path.with_file_name(name)
}

/// Every file a tool may leave behind for `path`
pub fn artifact_paths(path: &Path) -> Vec<PathBuf> {
    let mut paths = vec![path.to_path_buf()];
    for suffix in [".part", ".ytdl"] {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        paths.push(PathBuf::from(name));
    }
    paths
}

/// Best-effort removal; missing files are fine
pub async fn remove_artifacts(paths: &[PathBuf]) {
    for path in paths {
        for candidate in artifact_paths(path) {
            match tokio::fs::remove_file(&candidate).await {
                Ok(()) => tracing::debug!("[Cleanup] removed {}", candidate.display()),
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => tracing::warn!("[Cleanup] could not remove {}: {}", candidate.display(), e),
            }
        }
    }
}

/// Size of a finished tool output, or None if missing/empty
pub async fn non_empty_file_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(meta.len()),
        _ => None,
    }
}
