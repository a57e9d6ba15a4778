// CatalogSource trait and extraction settings

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::downloader::errors::JobError;
use crate::downloader::models::{FormatCatalog, PlaylistEntry};

/// Configuration for catalog lookups and stream tool invocations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// SOCKS5/HTTP proxy URL
    pub proxy: Option<String>,
    /// Path to cookies.txt file
    pub cookies_path: Option<String>,
    /// Browser to read cookies from (e.g. "chrome"); ignored when a cookies file is set
    pub cookies_from_browser: Option<String>,
    /// Socket timeout passed to yt-dlp, also bounds a catalog lookup
    pub timeout_seconds: u32,
    /// YouTube player clients tried in order (empty: tool default)
    pub player_clients: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            cookies_path: None,
            cookies_from_browser: None,
            timeout_seconds: 30,
            player_clients: Vec::new(),
        }
    }
}

impl ExtractorConfig {
    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_cookies_path(mut self, path: Option<String>) -> Self {
        self.cookies_path = path;
        self
    }

    pub fn with_cookies_from_browser(mut self, browser: Option<String>) -> Self {
        self.cookies_from_browser = browser;
        self
    }

    pub fn with_timeout(mut self, seconds: u32) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_player_clients(mut self, clients: Vec<String>) -> Self {
        self.player_clients = clients;
        self
    }

    /// Network/auth arguments shared by every yt-dlp invocation
    pub fn network_args(&self) -> Vec<String> {
        let mut args = vec![
            "--socket-timeout".to_string(),
            self.timeout_seconds.to_string(),
        ];

        if let Some(path) = &self.cookies_path {
            args.push("--cookies".to_string());
            args.push(path.clone());
        } else if let Some(browser) = &self.cookies_from_browser {
            args.push("--cookies-from-browser".to_string());
            args.push(browser.clone());
        }

        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }

        args
    }
}

/// Entries of a playlist, in playlist order
#[derive(Debug, Clone, Serialize)]
pub struct PlaylistListing {
    pub title: Option<String>,
    pub entries: Vec<PlaylistEntry>,
}

/// Where format catalogs and playlist listings come from
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Name of the source (for logging)
    fn name(&self) -> &'static str;

    /// Look up every stream variant offered for one item
    async fn fetch_catalog(&self, url: &str) -> Result<FormatCatalog, JobError>;

    /// Enumerate a playlist without resolving its entries
    async fn enumerate_playlist(&self, url: &str) -> Result<PlaylistListing, JobError>;
}
