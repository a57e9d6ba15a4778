// Common data models for the download and clip pipeline

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use super::errors::{JobError, JobFailure};
use super::utils::parse_range;

/// What a stream variant carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    VideoOnly,
    AudioOnly,
    Combined,
    /// Storyboards, images and anything without a usable codec
    Unknown,
}

impl MediaKind {
    /// Classify from the yt-dlp codec fields ("none" means absent)
    pub fn from_codecs(vcodec: Option<&str>, acodec: Option<&str>) -> Self {
        let present = |c: Option<&str>| c.map_or(false, |c| !c.is_empty() && c != "none");
        match (present(vcodec), present(acodec)) {
            (true, false) => Self::VideoOnly,
            (false, true) => Self::AudioOnly,
            (true, true) => Self::Combined,
            (false, false) => Self::Unknown,
        }
    }
}

/// One encoding of a media item offered by the source. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamVariant {
    /// Format ID (e.g., "137", "140")
    pub id: String,
    pub kind: MediaKind,
    /// Container extension (mp4, webm, m4a)
    pub ext: String,
    /// Video codec tag (avc1.640028, vp9, av01...)
    pub vcodec: Option<String>,
    /// Audio codec tag (mp4a.40.2, opus...)
    pub acodec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Total bitrate in kbps
    pub tbr: Option<f32>,
    /// Audio bitrate in kbps
    pub abr: Option<f32>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
    /// Direct media URL when the source exposes one
    pub url: Option<String>,
    /// Transfer protocol (https, m3u8_native, http_dash_segments...)
    pub protocol: Option<String>,
    #[serde(default)]
    pub http_headers: BTreeMap<String, String>,
}

impl StreamVariant {
    /// Get effective file size (exact or approximate)
    pub fn effective_size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }

    /// Check if format is H.264 (avc1)
    pub fn is_h264(&self) -> bool {
        self.vcodec
            .as_ref()
            .map_or(false, |v| v.starts_with("avc1") || v.starts_with("h264"))
    }

    pub fn is_vp9(&self) -> bool {
        self.vcodec
            .as_ref()
            .map_or(false, |v| v.starts_with("vp9") || v.starts_with("vp09"))
    }

    pub fn is_av1(&self) -> bool {
        self.vcodec
            .as_ref()
            .map_or(false, |v| v.starts_with("av01"))
    }

    /// Check if audio is AAC (m4a)
    pub fn is_aac(&self) -> bool {
        self.acodec
            .as_ref()
            .map_or(false, |a| a.starts_with("mp4a") || a == "aac")
    }

    /// Audio bitrate, falling back to total bitrate for audio-only streams
    pub fn audio_bitrate(&self) -> f32 {
        self.abr
            .or(if self.kind == MediaKind::AudioOnly { self.tbr } else { None })
            .unwrap_or(0.0)
    }

    /// Whether a plain HTTP GET of `url` yields the whole stream
    pub fn is_direct_http(&self) -> bool {
        self.url.is_some()
            && matches!(self.protocol.as_deref(), Some("https") | Some("http"))
    }
}

/// All variants offered for one media item, in catalog order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatCatalog {
    /// Source-side item id, e.g. the YouTube video id
    pub item_id: Option<String>,
    pub title: String,
    /// Duration in seconds when the source reports it
    pub duration: Option<f64>,
    pub webpage_url: Option<String>,
    pub variants: Vec<StreamVariant>,
}

/// DownloadJob lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Resolving,
    FetchingVideo,
    FetchingAudio,
    Merging,
    Complete,
    Failed,
    Cancelled,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::FetchingVideo => "fetching video",
            Self::FetchingAudio => "fetching audio",
            Self::Merging => "merging",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One media item as seen by its DownloadJob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    /// Source URL or reference
    pub source: String,
    pub title: Option<String>,
    pub duration: Option<f64>,
    /// Final output path; derived from the catalog when not set up front
    pub target_path: Option<PathBuf>,
}

impl MediaItem {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            title: None,
            duration: None,
            target_path: None,
        }
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    pub fn with_target_path(mut self, path: Option<PathBuf>) -> Self {
        self.target_path = path;
        self
    }
}

/// A playlist row; `position` is 1-based and defines processing order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub position: usize,
    pub item: MediaItem,
}

/// Half-open clip window [start, end) in seconds.
///
/// Only constructible through [`ClipRange::new`], so `start < end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClipRange {
    start: f64,
    end: f64,
}

impl ClipRange {
    pub fn new(start: f64, end: f64) -> Result<Self, JobError> {
        if !start.is_finite() || !end.is_finite() {
            return Err(JobError::InvalidRange(format!(
                "{}-{}: offsets must be finite",
                start, end
            )));
        }
        if start < 0.0 {
            return Err(JobError::InvalidRange(format!(
                "{}-{}: start is negative",
                start, end
            )));
        }
        if start >= end {
            return Err(JobError::InvalidRange(format!(
                "{}-{}: start must be before end",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

impl fmt::Display for ClipRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s-{:.3}s", self.start, self.end)
    }
}

/// A clip range as the caller gave it: offsets, or `START-END` text parsed
/// when the job plans its clips
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RangeRequest {
    Seconds(f64, f64),
    Text(String),
}

impl RangeRequest {
    pub fn offsets(&self) -> Result<(f64, f64), JobError> {
        match self {
            Self::Seconds(start, end) => Ok((*start, *end)),
            Self::Text(text) => parse_range(text),
        }
    }
}

impl From<(f64, f64)> for RangeRequest {
    fn from((start, end): (f64, f64)) -> Self {
        Self::Seconds(start, end)
    }
}

impl From<&str> for RangeRequest {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for RangeRequest {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Outcome of one requested clip range, in request order
#[derive(Debug, Clone, Serialize)]
pub struct ClipResult {
    /// 1-based position in the request
    pub index: usize,
    /// The range as requested
    pub requested: RangeRequest,
    /// Window actually cut (end may be clamped to the source duration)
    pub range: Option<ClipRange>,
    pub output_path: PathBuf,
    pub success: bool,
    pub error: Option<JobFailure>,
}

/// Per-entry status published while a playlist runs
#[derive(Debug, Clone, Serialize)]
pub struct EntryUpdate {
    pub position: usize,
    pub title: Option<String>,
    pub state: ItemState,
    /// Entry-local fraction
    pub progress: f64,
    pub error: Option<JobFailure>,
}

/// Fractional progress, or a phase that cannot measure itself
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobProgress {
    Fraction(f64),
    Indeterminate,
}

impl JobProgress {
    pub fn fraction(value: f64) -> Self {
        Self::Fraction(if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) })
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Fraction(v) => Some(*v),
            Self::Indeterminate => None,
        }
    }
}
