// Runtime configuration - folders, tool overrides, network and job tuning

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::downloader::extractors::{ExtractorConfig, YtDlpCatalog};
use crate::downloader::fetcher::{FetchBackend, HttpFetcher, RoutingFetcher, YtDlpFetcher};
use crate::downloader::job::{DownloadServices, RetryPolicy};
use crate::downloader::muxer::FfmpegTool;
use crate::downloader::tools::{ToolManager, ToolType, Toolchain};

const ENV_YTDLP: &str = "YT_CLIPPER_YTDLP";
const ENV_FFMPEG: &str = "YT_CLIPPER_FFMPEG";
const ENV_FFPROBE: &str = "YT_CLIPPER_FFPROBE";
const ENV_PROXY: &str = "YT_CLIPPER_PROXY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipperConfig {
    pub download_dir: PathBuf,
    pub clips_dir: PathBuf,
    pub ytdlp_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub extractor: ExtractorConfig,
    pub fetch_backend: FetchBackend,
    pub max_fetch_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Playlist entries downloaded at once; 1 keeps playlist order
    pub playlist_concurrency: usize,
    pub playlist_limit: usize,
    /// Concurrent ffmpeg processes
    pub media_concurrency: usize,
    pub progress_interval_ms: u64,
    pub cancel_poll_ms: u64,
    /// Catalog lookup timeout; defaults to four socket timeouts
    pub lookup_timeout_secs: Option<u64>,
}

impl Default for ClipperConfig {
    fn default() -> Self {
        let base = dirs::download_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            download_dir: base.clone(),
            clips_dir: base.join("clips"),
            ytdlp_path: None,
            ffmpeg_path: None,
            ffprobe_path: None,
            extractor: ExtractorConfig::default(),
            fetch_backend: FetchBackend::default(),
            max_fetch_attempts: 3,
            retry_backoff_ms: 2000,
            playlist_concurrency: 1,
            playlist_limit: 100,
            media_concurrency: num_cpus::get().max(1),
            progress_interval_ms: 250,
            cancel_poll_ms: 200,
            lookup_timeout_secs: None,
        }
    }
}

impl ClipperConfig {
    /// Read a JSON config; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: ClipperConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        tracing::info!("Loaded configuration from: {:?}", path);
        Ok(config)
    }

    /// Apply `YT_CLIPPER_*` environment overrides
    pub fn apply_env(self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        if let Some(path) = non_empty(ENV_YTDLP) {
            self.ytdlp_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty(ENV_FFMPEG) {
            self.ffmpeg_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty(ENV_FFPROBE) {
            self.ffprobe_path = Some(PathBuf::from(path));
        }
        if let Some(proxy) = non_empty(ENV_PROXY) {
            self.extractor.proxy = Some(proxy);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_fetch_attempts == 0 {
            bail!("max_fetch_attempts must be at least 1");
        }
        if self.playlist_concurrency == 0 {
            bail!("playlist_concurrency must be at least 1");
        }
        if self.playlist_limit == 0 {
            bail!("playlist_limit must be at least 1");
        }
        if self.media_concurrency == 0 {
            bail!("media_concurrency must be at least 1");
        }
        if self.extractor.timeout_seconds == 0 {
            bail!("extractor.timeout_seconds must be at least 1");
        }
        if self.cancel_poll_ms == 0 {
            bail!("cancel_poll_ms must be at least 1");
        }
        Ok(())
    }

    pub fn with_download_dir(mut self, dir: PathBuf) -> Self {
        self.download_dir = dir;
        self
    }

    pub fn with_clips_dir(mut self, dir: PathBuf) -> Self {
        self.clips_dir = dir;
        self
    }

    pub fn with_fetch_backend(mut self, backend: FetchBackend) -> Self {
        self.fetch_backend = backend;
        self
    }

    pub fn with_extractor(mut self, extractor: ExtractorConfig) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_playlist_concurrency(mut self, concurrency: usize) -> Self {
        self.playlist_concurrency = concurrency;
        self
    }

    /// Tool lookup honoring the configured path overrides
    pub fn tool_manager(&self) -> ToolManager {
        ToolManager::new()
            .with_override(ToolType::YtDlp, self.ytdlp_path.clone())
            .with_override(ToolType::Ffmpeg, self.ffmpeg_path.clone())
            .with_override(ToolType::Ffprobe, self.ffprobe_path.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_fetch_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Wire the production catalog, fetch and media implementations
    pub fn build_services(&self, tools: &Toolchain) -> Result<DownloadServices> {
        let progress = Duration::from_millis(self.progress_interval_ms);
        let poll = Duration::from_millis(self.cancel_poll_ms);

        let mut catalog = YtDlpCatalog::new(tools.ytdlp.clone(), self.extractor.clone())
            .with_playlist_limit(self.playlist_limit);
        if let Some(secs) = self.lookup_timeout_secs {
            catalog = catalog.with_lookup_timeout(secs);
        }

        let ytdlp = YtDlpFetcher::new(tools.ytdlp.clone(), self.extractor.clone())
            .with_intervals(progress, poll);
        let http = HttpFetcher::new(&self.extractor)
            .context("Failed to build HTTP client")?
            .with_intervals(progress, poll);
        let fetcher = RoutingFetcher::new(ytdlp, http, self.fetch_backend);

        let media = FfmpegTool::new(
            tools.ffmpeg.clone(),
            tools.ffprobe.clone(),
            self.media_concurrency,
        )
        .with_intervals(progress, poll);

        Ok(DownloadServices {
            catalog: Arc::new(catalog),
            fetcher: Arc::new(fetcher),
            media: Arc::new(media),
            retry: self.retry_policy(),
        })
    }
}
