// Error taxonomy shared by every job phase

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::extractors::diagnostics::{analyze_error, FailureReason};

/// Upper bound for raw tool output attached to a failure.
const DETAIL_LIMIT: usize = 2000;

/// Stable error kind reported to callers alongside the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoCompatibleFormat,
    NetworkError,
    QuotaOrAccessError,
    IncompleteTransfer,
    MuxError,
    PlaylistEnumerationError,
    DependencyMissing,
    InvalidRange,
    Cancelled,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoCompatibleFormat => "no_compatible_format",
            Self::NetworkError => "network_error",
            Self::QuotaOrAccessError => "quota_or_access_error",
            Self::IncompleteTransfer => "incomplete_transfer",
            Self::MuxError => "mux_error",
            Self::PlaylistEnumerationError => "playlist_enumeration_error",
            Self::DependencyMissing => "dependency_missing",
            Self::InvalidRange => "invalid_range",
            Self::Cancelled => "cancelled",
            Self::Io => "io",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The catalog offers nothing we can turn into a playable file
    #[error("No compatible format: {0}")]
    NoCompatibleFormat(String),

    /// Transient transport failure, retried by the owning phase
    #[error("Network error: {message}")]
    Network {
        message: String,
        detail: Option<String>,
    },

    /// Access denied, rate limited, DRM, geo block and friends
    #[error("Access denied: {message}")]
    QuotaOrAccess {
        message: String,
        detail: Option<String>,
    },

    #[error("Incomplete transfer: received {received} of {expected} bytes")]
    IncompleteTransfer { received: u64, expected: u64 },

    /// The media tool exited non-zero or produced no output
    #[error("Media tool failed: {message}")]
    Mux {
        message: String,
        detail: Option<String>,
    },

    #[error("Playlist enumeration failed: {0}")]
    PlaylistEnumeration(String),

    #[error("Required tool not found: {0}")]
    DependencyMissing(String),

    #[error("Invalid clip range: {0}")]
    InvalidRange(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),
}

impl JobError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            detail: None,
        }
    }

    pub fn mux(message: impl Into<String>, stderr: &str) -> Self {
        Self::Mux {
            message: message.into(),
            detail: clip_detail(stderr),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoCompatibleFormat(_) => ErrorKind::NoCompatibleFormat,
            Self::Network { .. } => ErrorKind::NetworkError,
            Self::QuotaOrAccess { .. } => ErrorKind::QuotaOrAccessError,
            Self::IncompleteTransfer { .. } => ErrorKind::IncompleteTransfer,
            Self::Mux { .. } => ErrorKind::MuxError,
            Self::PlaylistEnumeration(_) => ErrorKind::PlaylistEnumerationError,
            Self::DependencyMissing(_) => ErrorKind::DependencyMissing,
            Self::InvalidRange(_) => ErrorKind::InvalidRange,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Only transport-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::IncompleteTransfer { .. })
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Network { detail, .. }
            | Self::QuotaOrAccess { detail, .. }
            | Self::Mux { detail, .. } => detail.as_deref(),
            _ => None,
        }
    }

    /// Classify stderr from the catalog/stream tool.
    ///
    /// The primary message is the diagnosed reason; the raw output only travels
    /// as detail.
    pub fn from_tool_stderr(stderr: &str) -> Self {
        let reason = analyze_error(stderr).reason;
        let message = reason.description().to_string();
        let detail = clip_detail(stderr);

        match reason {
            FailureReason::FormatUnavailable => Self::NoCompatibleFormat(message),
            r if r.is_transient() => Self::Network { message, detail },
            _ => Self::QuotaOrAccess { message, detail },
        }
    }
}

impl From<std::io::Error> for JobError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<reqwest::Error> for JobError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.is_client_error() => Self::QuotaOrAccess {
                message: format!("HTTP {}", status),
                detail: Some(e.to_string()),
            },
            _ => Self::Network {
                message: if e.is_timeout() {
                    "Request timed out".to_string()
                } else {
                    "Transfer interrupted".to_string()
                },
                detail: Some(e.to_string()),
            },
        }
    }
}

/// Structured failure carried by terminal events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&JobError> for JobFailure {
    fn from(e: &JobError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            detail: e.detail().map(str::to_string),
        }
    }
}

impl From<JobError> for JobFailure {
    fn from(e: JobError) -> Self {
        Self::from(&e)
    }
}

/// Keep the tail of tool output, where the actual error usually is.
fn clip_detail(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let count = trimmed.chars().count();
    if count <= DETAIL_LIMIT {
        return Some(trimmed.to_string());
    }
    Some(trimmed.chars().skip(count - DETAIL_LIMIT).collect())
}
