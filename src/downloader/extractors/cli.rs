// yt-dlp catalog source - format lookups and flat playlist listings
//
// Single items: `yt-dlp --dump-json --no-playlist URL`
// Playlists:    `yt-dlp --flat-playlist -J --playlist-end N URL`

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::diagnostics::analyze_error;
use super::traits::{CatalogSource, ExtractorConfig, PlaylistListing};
use crate::downloader::errors::JobError;
use crate::downloader::models::{FormatCatalog, MediaItem, MediaKind, PlaylistEntry, StreamVariant};
use crate::downloader::utils::run_output_with_timeout;

const WATCH_URL: &str = "https://www.youtube.com/watch?v=";

/// CLI-based catalog source using the yt-dlp binary
pub struct YtDlpCatalog {
    ytdlp_path: PathBuf,
    config: ExtractorConfig,
    playlist_limit: usize,
    lookup_timeout_secs: u64,
}

impl YtDlpCatalog {
    pub fn new(ytdlp_path: PathBuf, config: ExtractorConfig) -> Self {
        let lookup_timeout_secs = u64::from(config.timeout_seconds) * 4;
        Self {
            ytdlp_path,
            config,
            playlist_limit: 100,
            lookup_timeout_secs,
        }
    }

    pub fn with_playlist_limit(mut self, limit: usize) -> Self {
        self.playlist_limit = limit.max(1);
        self
    }

    pub fn with_lookup_timeout(mut self, seconds: u64) -> Self {
        self.lookup_timeout_secs = seconds.max(1);
        self
    }

    fn is_youtube(url: &str) -> bool {
        let lower = url.to_lowercase();
        lower.contains("youtube.com") || lower.contains("youtu.be")
    }

    /// Build command arguments
    fn build_args(&self, url: &str, client: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "--dump-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        args.extend(self.config.network_args());

        if let Some(client) = client {
            args.push("--extractor-args".to_string());
            args.push(format!("youtube:player_client={}", client));
        }

        args.push(url.to_string());
        args
    }

    fn build_playlist_args(&self, url: &str) -> Vec<String> {
        let mut args = vec![
            "--flat-playlist".to_string(),
            "-J".to_string(),
            "--no-warnings".to_string(),
            "--playlist-end".to_string(),
            self.playlist_limit.to_string(),
        ];
        args.extend(self.config.network_args());
        args.push(url.to_string());
        args
    }

    /// Parse `--dump-json` output into a catalog
    pub fn parse_catalog(stdout: &[u8]) -> Result<FormatCatalog, JobError> {
        let json: serde_json::Value = serde_json::from_slice(stdout)
            .map_err(|e| JobError::NoCompatibleFormat(format!("Unreadable catalog: {}", e)))?;

        let formats = json["formats"]
            .as_array()
            .ok_or_else(|| JobError::NoCompatibleFormat("No formats array in catalog".to_string()))?;

        let variants = formats.iter().filter_map(Self::parse_variant).collect();

        Ok(FormatCatalog {
            item_id: json["id"].as_str().map(str::to_string),
            title: json["title"].as_str().unwrap_or("Unknown").to_string(),
            duration: json["duration"].as_f64(),
            webpage_url: json["webpage_url"].as_str().map(str::to_string),
            variants,
        })
    }

    fn parse_variant(f: &serde_json::Value) -> Option<StreamVariant> {
        let id = f["format_id"].as_str()?.to_string();
        let vcodec = f["vcodec"].as_str().map(str::to_string);
        let acodec = f["acodec"].as_str().map(str::to_string);
        let kind = MediaKind::from_codecs(vcodec.as_deref(), acodec.as_deref());

        let http_headers: BTreeMap<String, String> = f["http_headers"]
            .as_object()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Some(StreamVariant {
            id,
            kind,
            ext: f["ext"].as_str().unwrap_or("").to_string(),
            vcodec,
            acodec,
            width: f["width"].as_u64().map(|w| w as u32),
            height: f["height"].as_u64().map(|h| h as u32),
            tbr: f["tbr"].as_f64().map(|t| t as f32),
            abr: f["abr"].as_f64().map(|a| a as f32),
            filesize: f["filesize"].as_u64(),
            filesize_approx: f["filesize_approx"].as_u64(),
            url: f["url"].as_str().map(str::to_string),
            protocol: f["protocol"].as_str().map(str::to_string),
            http_headers,
        })
    }

    /// Parse `--flat-playlist -J` output
    pub fn parse_playlist(stdout: &[u8], limit: usize) -> Result<PlaylistListing, JobError> {
        let json: serde_json::Value = serde_json::from_slice(stdout)
            .map_err(|e| JobError::PlaylistEnumeration(format!("Unreadable playlist: {}", e)))?;

        let raw_entries = json["entries"]
            .as_array()
            .ok_or_else(|| JobError::PlaylistEnumeration("Source is not a playlist".to_string()))?;

        let entries: Vec<PlaylistEntry> = raw_entries
            .iter()
            .filter(|e| !e.is_null())
            .filter_map(|e| {
                let url = e["url"]
                    .as_str()
                    .or_else(|| e["webpage_url"].as_str())
                    .map(str::to_string)
                    .or_else(|| e["id"].as_str().map(|id| format!("{}{}", WATCH_URL, id)))?;
                let title = e["title"].as_str().map(str::to_string);
                Some(MediaItem::new(url).with_title(title))
            })
            .take(limit)
            .enumerate()
            .map(|(i, item)| PlaylistEntry {
                position: i + 1,
                item,
            })
            .collect();

        if entries.is_empty() {
            return Err(JobError::PlaylistEnumeration(
                "Playlist has no downloadable entries".to_string(),
            ));
        }

        Ok(PlaylistListing {
            title: json["title"].as_str().map(str::to_string),
            entries,
        })
    }

    /// Try extraction with each configured player client
    async fn try_with_clients(&self, url: &str) -> Result<FormatCatalog, JobError> {
        let clients: Vec<Option<&str>> =
            if Self::is_youtube(url) && !self.config.player_clients.is_empty() {
                self.config.player_clients.iter().map(|c| Some(c.as_str())).collect()
            } else {
                vec![None]
            };

        let mut last_error = JobError::network("No clients to try");

        for (attempt, client) in clients.iter().enumerate() {
            let args = self.build_args(url, *client);
            debug!(
                "[YtDlpCatalog] client={} {} {}",
                client.unwrap_or("default"),
                self.ytdlp_path.display(),
                args.join(" ")
            );

            let out = run_output_with_timeout(&self.ytdlp_path, args, self.lookup_timeout_secs).await?;
            if out.status.success() {
                return Self::parse_catalog(&out.stdout);
            }

            let stderr = String::from_utf8_lossy(&out.stderr);
            let diagnostics = analyze_error(&stderr);
            warn!(
                "[YtDlpCatalog] client {} failed: {} ({})",
                client.unwrap_or("default"),
                diagnostics.reason.description(),
                diagnostics.context.as_deref().unwrap_or("no error line")
            );
            last_error = JobError::from_tool_stderr(&stderr);

            // another client only helps when the refusal is client-specific
            let more = attempt + 1 < clients.len();
            if !(more && diagnostics.reason.cookies_might_help()) {
                break;
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl CatalogSource for YtDlpCatalog {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn fetch_catalog(&self, url: &str) -> Result<FormatCatalog, JobError> {
        let catalog = self.try_with_clients(url).await?;
        info!(
            "[YtDlpCatalog] '{}': {} variants",
            catalog.title,
            catalog.variants.len()
        );
        Ok(catalog)
    }

    async fn enumerate_playlist(&self, url: &str) -> Result<PlaylistListing, JobError> {
        let args = self.build_playlist_args(url);
        debug!("[YtDlpCatalog] {} {}", self.ytdlp_path.display(), args.join(" "));

        let out = run_output_with_timeout(&self.ytdlp_path, args, self.lookup_timeout_secs)
            .await
            .map_err(|e| match e {
                JobError::DependencyMissing(_) => e,
                other => JobError::PlaylistEnumeration(other.to_string()),
            })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let reason = analyze_error(&stderr).reason;
            return Err(JobError::PlaylistEnumeration(reason.description().to_string()));
        }

        let listing = Self::parse_playlist(&out.stdout, self.playlist_limit)?;
        info!(
            "[YtDlpCatalog] playlist '{}': {} entries",
            listing.title.as_deref().unwrap_or("untitled"),
            listing.entries.len()
        );
        Ok(listing)
    }
}
