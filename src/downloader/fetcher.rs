// StreamFetcher - retrieves one stream variant to a local file
//
// Every backend follows the same discipline:
// - bytes go to a temporary sibling, renamed onto the destination only after
//   the transfer is complete
// - progress passes through a ProgressNormalizer before reaching the caller
// - cancellation is polled at a bounded interval and removes the temp file

use async_trait::async_trait;
use futures_util::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

use super::errors::JobError;
use super::extractors::ExtractorConfig;
use super::models::StreamVariant;
use super::progress::{CancelFlag, ProgressNormalizer};
use super::utils::{non_empty_file_size, remove_artifacts, spawn_error, temp_sibling};

/// Marker yt-dlp prints in front of our progress template
const PROGRESS_TAG: &str = "[clipper-progress]";

/// Progress callback handed to a fetch, receives phase-local fractions
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// What to fetch: the item's page URL plus the chosen variant
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub source_url: &'a str,
    pub variant: &'a StreamVariant,
}

#[async_trait]
pub trait StreamFetcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Download `request.variant` to `destination` and return that path.
    async fn fetch(
        &self,
        request: FetchRequest<'_>,
        destination: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError>;
}

/// Which transport moves the bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchBackend {
    /// yt-dlp handles every protocol (DASH, HLS, throttled https)
    #[default]
    Ytdlp,
    /// Plain HTTP GET for variants that expose a direct URL, yt-dlp otherwise
    Http,
}

/// One parsed progress report from yt-dlp
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToolProgress {
    Bytes {
        downloaded: u64,
        total: Option<u64>,
        /// total came from `total_bytes`, not an estimate
        exact: bool,
    },
    Percent(f64),
}

/// Parse a `--progress-template` line, or a classic `[download] x%` line
pub fn parse_progress_line(line: &str) -> Option<ToolProgress> {
    lazy_static! {
        static ref TEMPLATE_RE: Regex =
            Regex::new(r"^\[clipper-progress\]\s+(\d+|NA)/(\d+|NA)/([\d.]+|NA)").unwrap();
        static ref PERCENT_RE: Regex = Regex::new(r"\[download\]\s+(\d+\.?\d*)%").unwrap();
    }

    if let Some(caps) = TEMPLATE_RE.captures(line.trim()) {
        let downloaded: u64 = caps.get(1)?.as_str().parse().ok()?;
        let exact: Option<u64> = caps.get(2).and_then(|m| m.as_str().parse().ok());
        let estimate: Option<u64> = caps
            .get(3)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(|e| e as u64);
        return Some(ToolProgress::Bytes {
            downloaded,
            total: exact.or(estimate),
            exact: exact.is_some(),
        });
    }

    let caps = PERCENT_RE.captures(line)?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(ToolProgress::Percent(percent / 100.0))
}

/// yt-dlp output templates treat `%` as a field marker
fn escape_template(path: &Path) -> String {
    path.to_string_lossy().replace('%', "%%")
}

enum ChildExit {
    Finished(std::process::ExitStatus),
    Cancelled,
}

/// Fetches a single format through `yt-dlp -f <id>`
pub struct YtDlpFetcher {
    ytdlp_path: PathBuf,
    config: ExtractorConfig,
    progress_interval: Duration,
    poll_interval: Duration,
}

impl YtDlpFetcher {
    pub fn new(ytdlp_path: PathBuf, config: ExtractorConfig) -> Self {
        Self {
            ytdlp_path,
            config,
            progress_interval: Duration::from_millis(250),
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_intervals(mut self, progress: Duration, poll: Duration) -> Self {
        self.progress_interval = progress;
        self.poll_interval = poll.max(Duration::from_millis(10));
        self
    }

    fn build_args(&self, request: &FetchRequest<'_>, temp: &Path) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            request.variant.id.clone(),
            "-o".to_string(),
            escape_template(temp),
            "--no-part".to_string(),
            "--force-overwrites".to_string(),
            "--no-playlist".to_string(),
            "--no-mtime".to_string(),
            "--newline".to_string(),
            "--no-warnings".to_string(),
            "--progress-template".to_string(),
            format!(
                "download:{} %(progress.downloaded_bytes)s/%(progress.total_bytes)s/%(progress.total_bytes_estimate)s",
                PROGRESS_TAG
            ),
        ];
        args.extend(self.config.network_args());
        args.push(request.source_url.to_string());
        args
    }

    async fn transfer(
        &self,
        request: FetchRequest<'_>,
        temp: &Path,
        destination: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError> {
        cancel.check()?;

        let args = self.build_args(&request, temp);
        debug!("[YtDlpFetcher] {} {}", self.ytdlp_path.display(), args.join(" "));

        let mut child = TokioCommand::new(&self.ytdlp_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.ytdlp_path, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::Io("Failed to capture yt-dlp stdout".to_string()))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| JobError::Io("Failed to capture yt-dlp stderr".to_string()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut normalizer = ProgressNormalizer::new(self.progress_interval);
        let mut exact_total: Option<u64> = None;
        let mut handle_line = |line: &str| match parse_progress_line(line) {
            Some(ToolProgress::Bytes {
                downloaded,
                total,
                exact,
            }) => {
                if exact {
                    exact_total = total;
                }
                if let Some(f) = normalizer.observe_bytes(downloaded, total) {
                    on_progress(f);
                }
            }
            Some(ToolProgress::Percent(p)) => {
                if let Some(f) = normalizer.observe(p) {
                    on_progress(f);
                }
            }
            None => debug!("[yt-dlp] {}", line),
        };

        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut stdout_open = true;
        let exit = loop {
            tokio::select! {
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => handle_line(&line),
                    _ => stdout_open = false,
                },
                status = child.wait() => break ChildExit::Finished(status?),
                _ = ticker.tick() => {
                    if cancel.is_cancelled() {
                        break ChildExit::Cancelled;
                    }
                }
            }
        };

        let status = match exit {
            ChildExit::Cancelled => {
                let _ = child.kill().await;
                stderr_task.abort();
                info!("[YtDlpFetcher] format {} cancelled", request.variant.id);
                return Err(JobError::Cancelled);
            }
            ChildExit::Finished(status) => status,
        };

        // the process is gone; whatever is still buffered is the tail
        while let Ok(Some(line)) = lines.next_line().await {
            handle_line(&line);
        }
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            warn!(
                "[YtDlpFetcher] format {} exited with {}",
                request.variant.id, status
            );
            return Err(JobError::from_tool_stderr(&stderr));
        }

        let received = non_empty_file_size(temp).await.unwrap_or(0);
        let expected = exact_total.or(request.variant.filesize);
        match expected {
            Some(expected) if received < expected => {
                return Err(JobError::IncompleteTransfer { received, expected })
            }
            None if received == 0 => {
                return Err(JobError::IncompleteTransfer {
                    received: 0,
                    expected: 0,
                })
            }
            _ => {}
        }

        tokio::fs::rename(temp, destination).await?;
        if let Some(f) = normalizer.finish() {
            on_progress(f);
        }
        Ok(destination.to_path_buf())
    }
}

#[async_trait]
impl StreamFetcher for YtDlpFetcher {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn fetch(
        &self,
        request: FetchRequest<'_>,
        destination: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError> {
        let temp = temp_sibling(destination, "part");
        let result = self
            .transfer(request, &temp, destination, on_progress, cancel)
            .await;
        if result.is_err() {
            remove_artifacts(&[temp]).await;
        }
        result
    }
}

/// Streams a direct media URL with reqwest
pub struct HttpFetcher {
    client: reqwest::Client,
    /// Longest wait for response headers or for the next body chunk
    stall_timeout: Duration,
    progress_interval: Duration,
    poll_interval: Duration,
}

impl HttpFetcher {
    pub fn new(config: &ExtractorConfig) -> Result<Self, JobError> {
        let stall_timeout = Duration::from_secs(u64::from(config.timeout_seconds.max(1)));
        let mut builder = reqwest::Client::builder().connect_timeout(stall_timeout);
        if let Some(proxy_url) = config.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| JobError::network(format!("Invalid proxy {}: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| JobError::network(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            stall_timeout,
            progress_interval: Duration::from_millis(250),
            poll_interval: Duration::from_millis(200),
        })
    }

    pub fn with_intervals(mut self, progress: Duration, poll: Duration) -> Self {
        self.progress_interval = progress;
        self.poll_interval = poll.max(Duration::from_millis(10));
        self
    }

    async fn transfer(
        &self,
        variant: &StreamVariant,
        temp: &Path,
        destination: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError> {
        cancel.check()?;

        let url = variant.url.as_deref().ok_or_else(|| {
            JobError::NoCompatibleFormat(format!("format {} has no direct URL", variant.id))
        })?;

        let mut request = self.client.get(url);
        for (name, value) in &variant.http_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        let stall = tokio::time::sleep(self.stall_timeout);
        tokio::pin!(stall);

        let send = request.send();
        tokio::pin!(send);
        let response = loop {
            tokio::select! {
                response = &mut send => break response?.error_for_status()?,
                _ = ticker.tick() => cancel.check()?,
                _ = &mut stall => {
                    return Err(JobError::network(format!(
                        "No response within {}s",
                        self.stall_timeout.as_secs()
                    )));
                }
            }
        };
        let expected = response.content_length().or(variant.filesize);

        let mut file = tokio::fs::File::create(temp).await?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;
        let mut normalizer = ProgressNormalizer::new(self.progress_interval);
        stall.as_mut().reset(tokio::time::Instant::now() + self.stall_timeout);

        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        file.write_all(&chunk).await?;
                        received += chunk.len() as u64;
                        stall.as_mut().reset(tokio::time::Instant::now() + self.stall_timeout);
                        if let Some(f) = normalizer.observe_bytes(received, expected) {
                            on_progress(f);
                        }
                    }
                    Some(Err(e)) => {
                        debug!("[HttpFetcher] body error after {} bytes: {}", received, e);
                        return Err(match expected {
                            Some(expected) if received < expected => {
                                JobError::IncompleteTransfer { received, expected }
                            }
                            _ => e.into(),
                        });
                    }
                    None => break,
                },
                _ = ticker.tick() => cancel.check()?,
                _ = &mut stall => {
                    return Err(JobError::network(format!(
                        "Transfer stalled after {} bytes",
                        received
                    )));
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = expected {
            if received < expected {
                return Err(JobError::IncompleteTransfer { received, expected });
            }
        }

        tokio::fs::rename(temp, destination).await?;
        if let Some(f) = normalizer.finish() {
            on_progress(f);
        }
        info!("[HttpFetcher] format {}: {} bytes", variant.id, received);
        Ok(destination.to_path_buf())
    }
}

#[async_trait]
impl StreamFetcher for HttpFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(
        &self,
        request: FetchRequest<'_>,
        destination: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError> {
        let temp = temp_sibling(destination, "part");
        let result = self
            .transfer(request.variant, &temp, destination, on_progress, cancel)
            .await;
        if result.is_err() {
            remove_artifacts(&[temp]).await;
        }
        result
    }
}

/// Picks a backend per variant according to the configured preference
pub struct RoutingFetcher {
    ytdlp: YtDlpFetcher,
    http: HttpFetcher,
    backend: FetchBackend,
}

impl RoutingFetcher {
    pub fn new(ytdlp: YtDlpFetcher, http: HttpFetcher, backend: FetchBackend) -> Self {
        Self {
            ytdlp,
            http,
            backend,
        }
    }

    fn route(&self, variant: &StreamVariant) -> &dyn StreamFetcher {
        match self.backend {
            FetchBackend::Http if variant.is_direct_http() => &self.http,
            _ => &self.ytdlp,
        }
    }
}

#[async_trait]
impl StreamFetcher for RoutingFetcher {
    fn name(&self) -> &'static str {
        "routing"
    }

    async fn fetch(
        &self,
        request: FetchRequest<'_>,
        destination: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, JobError> {
        let backend = self.route(request.variant);
        debug!(
            "[RoutingFetcher] format {} via {}",
            request.variant.id,
            backend.name()
        );
        backend.fetch(request, destination, on_progress, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::errors::ErrorKind;
    use crate::downloader::test_support::{audio_variant, dir_entries, video_variant};
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    /// Answer one connection with `response`, then close it
    async fn serve_once(response: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{}/media/140", addr)
    }

    /// Accept a connection and never answer
    async fn serve_silence() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });
        format!("http://{}/media/140", addr)
    }

    fn direct_audio(url: String) -> StreamVariant {
        let mut variant = audio_variant("140", 128.0, "mp4a.40.2");
        variant.url = Some(url);
        variant.protocol = Some("http".into());
        variant
    }

    fn http_fetcher(timeout_seconds: u32) -> HttpFetcher {
        let config = ExtractorConfig {
            timeout_seconds,
            ..ExtractorConfig::default()
        };
        HttpFetcher::new(&config)
            .unwrap()
            .with_intervals(Duration::ZERO, Duration::from_millis(20))
    }

    async fn fetch_with(
        fetcher: &dyn StreamFetcher,
        variant: &StreamVariant,
        destination: &Path,
        cancel: &CancelFlag,
    ) -> (Result<PathBuf, JobError>, Vec<f64>) {
        let seen = Mutex::new(Vec::new());
        let on_progress = |f: f64| seen.lock().push(f);
        let result = fetcher
            .fetch(
                FetchRequest {
                    source_url: "https://example.com/watch?v=abc",
                    variant,
                },
                destination,
                &on_progress,
                cancel,
            )
            .await;
        (result, seen.into_inner())
    }

    #[test]
    fn test_parse_template_line() {
        assert_eq!(
            parse_progress_line("[clipper-progress] 1024/4096/NA"),
            Some(ToolProgress::Bytes {
                downloaded: 1024,
                total: Some(4096),
                exact: true
            })
        );
        assert_eq!(
            parse_progress_line("[clipper-progress] 10/NA/2000.5"),
            Some(ToolProgress::Bytes {
                downloaded: 10,
                total: Some(2000),
                exact: false
            })
        );
        assert_eq!(
            parse_progress_line("[clipper-progress] 10/NA/NA"),
            Some(ToolProgress::Bytes {
                downloaded: 10,
                total: None,
                exact: false
            })
        );
    }

    #[test]
    fn test_parse_classic_download_line() {
        let line = "[download]  12.5% of ~ 310.04MiB at  374.36KiB/s ETA 11:59 (frag 56/454)";
        match parse_progress_line(line) {
            Some(ToolProgress::Percent(p)) => assert!((p - 0.125).abs() < 1e-9),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parse_progress_line("[youtube] abc: Downloading webpage"), None);
    }

    #[test]
    fn test_ytdlp_args() {
        let fetcher = YtDlpFetcher::new(PathBuf::from("yt-dlp"), ExtractorConfig::default());
        let variant = video_variant("137", 1080, "avc1.640028");
        let request = FetchRequest {
            source_url: "https://www.youtube.com/watch?v=abc",
            variant: &variant,
        };
        let args = fetcher.build_args(&request, Path::new("/tmp/100% [abc].part.mp4"));
        let f = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[f + 1], "137");
        let o = args.iter().position(|a| a == "-o").unwrap();
        assert_eq!(args[o + 1], "/tmp/100%% [abc].part.mp4");
        assert!(args.contains(&"--no-part".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn test_routing_prefers_http_only_for_direct_urls() {
        let config = ExtractorConfig::default();
        let router = RoutingFetcher::new(
            YtDlpFetcher::new(PathBuf::from("yt-dlp"), config.clone()),
            HttpFetcher::new(&config).unwrap(),
            FetchBackend::Http,
        );

        let mut direct = audio_variant("140", 128.0, "mp4a.40.2");
        direct.url = Some("https://cdn.example/140".into());
        direct.protocol = Some("https".into());
        assert_eq!(router.route(&direct).name(), "http");

        let mut dash = video_variant("137", 1080, "avc1");
        dash.url = Some("https://cdn.example/manifest".into());
        dash.protocol = Some("http_dash_segments".into());
        assert_eq!(router.route(&dash).name(), "yt-dlp");
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.mp4");
        let fetcher = YtDlpFetcher::new(PathBuf::from("yt-dlp"), ExtractorConfig::default());
        let variant = video_variant("137", 1080, "avc1");
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = fetcher
            .fetch(
                FetchRequest {
                    source_url: "https://example.com/v",
                    variant: &variant,
                },
                &dest,
                &|_| {},
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(JobError::Cancelled)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_http_fetch_requires_direct_url() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new(&ExtractorConfig::default()).unwrap();
        let variant = video_variant("137", 1080, "avc1");
        let result = fetcher
            .fetch(
                FetchRequest {
                    source_url: "https://example.com/v",
                    variant: &variant,
                },
                &dir.path().join("out.mp4"),
                &|_| {},
                &CancelFlag::new(),
            )
            .await;
        assert!(matches!(result, Err(JobError::NoCompatibleFormat(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_http_fetch_writes_whole_body() {
        let dir = tempfile::tempdir().unwrap();
        let body = vec![7u8; 4096];
        let mut response = b"HTTP/1.1 200 OK\r\nContent-Length: 4096\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(&body);
        let variant = direct_audio(serve_once(response).await);
        let dest = dir.path().join("out.m4a");

        let (result, progress) =
            fetch_with(&http_fetcher(30), &variant, &dest, &CancelFlag::new()).await;

        assert_eq!(result.unwrap(), dest);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert_eq!(dir_entries(dir.path()), vec!["out.m4a".to_string()]);
        assert!(progress.windows(2).all(|w| w[0] < w[1]), "{:?}", progress);
        assert_eq!(progress.last(), Some(&1.0));
    }

    #[tokio::test]
    async fn test_http_short_body_is_incomplete_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let mut response = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(&[1u8; 40]);
        let variant = direct_audio(serve_once(response).await);

        let (result, progress) = fetch_with(
            &http_fetcher(30),
            &variant,
            &dir.path().join("out.m4a"),
            &CancelFlag::new(),
        )
        .await;

        match result {
            Err(JobError::IncompleteTransfer { received, expected }) => {
                assert!(received < 100);
                assert_eq!(expected, 100);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(dir_entries(dir.path()).is_empty());
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert!(progress.iter().all(|f| *f < 1.0));
    }

    #[tokio::test]
    async fn test_http_error_status_is_access_error() {
        let dir = tempfile::tempdir().unwrap();
        let response = b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec();
        let variant = direct_audio(serve_once(response).await);

        let (result, _) = fetch_with(
            &http_fetcher(30),
            &variant,
            &dir.path().join("out.m4a"),
            &CancelFlag::new(),
        )
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::QuotaOrAccessError);
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_http_cancel_while_waiting_for_headers() {
        let dir = tempfile::tempdir().unwrap();
        let variant = direct_audio(serve_silence().await);
        let fetcher = http_fetcher(30);
        let cancel = CancelFlag::new();

        let canceller = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            }
        });
        let dest = dir.path().join("out.m4a");
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            fetch_with(&fetcher, &variant, &dest, &cancel),
        )
        .await;
        canceller.await.unwrap();

        let (result, _) = outcome.expect("fetch ignored cancellation");
        assert!(matches!(result, Err(JobError::Cancelled)));
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_http_silent_server_times_out_as_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let variant = direct_audio(serve_silence().await);
        let dest = dir.path().join("out.m4a");

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            fetch_with(&http_fetcher(1), &variant, &dest, &CancelFlag::new()),
        )
        .await;

        let (result, _) = outcome.expect("fetch never gave up");
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert!(err.is_retryable());
    }

    #[cfg(unix)]
    mod ytdlp_process {
        use super::*;
        use crate::downloader::test_support::stub_tool;

        const TAKE_OUTPUT: &str = r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done"#;

        fn fetcher(script: &str) -> (tempfile::TempDir, YtDlpFetcher) {
            let tools = tempfile::tempdir().unwrap();
            let ytdlp = stub_tool(
                tools.path(),
                "yt-dlp",
                &format!("{}\n{}", TAKE_OUTPUT, script),
            );
            let fetcher = YtDlpFetcher::new(ytdlp, ExtractorConfig::default())
                .with_intervals(Duration::ZERO, Duration::from_millis(20));
            (tools, fetcher)
        }

        #[tokio::test]
        async fn test_ytdlp_progress_and_rename() {
            let (_tools, fetcher) = fetcher(
                r#"echo "[youtube] abc: Downloading webpage"
printf '0123456789' > "$out"
echo "[clipper-progress] 4/10/NA"
echo "[clipper-progress] 10/10/NA""#,
            );
            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join("Talk.video.mp4");
            let variant = video_variant("137", 1080, "avc1");

            let (result, progress) = fetch_with(&fetcher, &variant, &dest, &CancelFlag::new()).await;

            assert_eq!(result.unwrap(), dest);
            assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
            assert_eq!(dir_entries(dir.path()), vec!["Talk.video.mp4".to_string()]);
            assert_eq!(progress, vec![0.4, 1.0]);
        }

        #[tokio::test]
        async fn test_ytdlp_failure_is_classified_from_stderr() {
            let (_tools, fetcher) = fetcher(
                r#"printf 'half' > "$out"
echo "ERROR: unable to download video data: HTTP Error 403: Forbidden" >&2
exit 1"#,
            );
            let dir = tempfile::tempdir().unwrap();
            let variant = video_variant("137", 1080, "avc1");

            let (result, _) = fetch_with(
                &fetcher,
                &variant,
                &dir.path().join("Talk.video.mp4"),
                &CancelFlag::new(),
            )
            .await;

            let err = result.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::QuotaOrAccessError);
            assert!(err.detail().unwrap().contains("403"));
            assert!(dir_entries(dir.path()).is_empty());
        }

        #[tokio::test]
        async fn test_ytdlp_empty_output_is_incomplete() {
            let (_tools, fetcher) = fetcher(r#": > "$out""#);
            let dir = tempfile::tempdir().unwrap();
            let variant = video_variant("137", 1080, "avc1");

            let (result, _) = fetch_with(
                &fetcher,
                &variant,
                &dir.path().join("Talk.video.mp4"),
                &CancelFlag::new(),
            )
            .await;

            assert_eq!(result.unwrap_err().kind(), ErrorKind::IncompleteTransfer);
            assert!(dir_entries(dir.path()).is_empty());
        }

        #[tokio::test]
        async fn test_ytdlp_cancel_kills_process() {
            let (_tools, fetcher) = fetcher(
                r#"printf 'partial' > "$out"
exec sleep 30"#,
            );
            let dir = tempfile::tempdir().unwrap();
            let variant = video_variant("137", 1080, "avc1");
            let cancel = CancelFlag::new();

            let canceller = tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    cancel.cancel();
                }
            });
            let dest = dir.path().join("Talk.video.mp4");
            let outcome = tokio::time::timeout(
                Duration::from_secs(5),
                fetch_with(&fetcher, &variant, &dest, &cancel),
            )
            .await;
            canceller.await.unwrap();

            let (result, _) = outcome.expect("cancel did not stop yt-dlp");
            assert!(matches!(result, Err(JobError::Cancelled)));
            assert!(dir_entries(dir.path()).is_empty());
        }
    }
}
