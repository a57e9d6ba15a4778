// Failure diagnostics - turns yt-dlp stderr into a stable reason
//
// The reason decides two things downstream:
// - which error kind the job reports (network, access, format)
// - whether the failing phase gets another attempt

use serde::{Deserialize, Serialize};

/// Why the catalog/stream tool refused or failed a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// HTTP 403 Forbidden - general access denied
    Http403Forbidden,

    /// SABR streaming protection hides the adaptive formats
    SabrStreaming,

    /// Proof of Origin token required by the player client
    PoTokenRequired,

    AgeRestricted,
    GeoBlocked,

    /// Socket or read timeout (often a soft IP throttle)
    NetworkTimeout,

    /// DNS failure, refused or reset connection
    ConnectionFailed,

    /// HTTP 429 or an explicit rate limit message
    RateLimited,

    BotDetection,
    PrivateVideo,
    VideoUnavailable,

    /// Widevine/PlayReady/FairPlay, rentals, Premium-only content
    DrmProtected,

    MembersOnly,

    /// The URL is not something the tool can extract from
    UnsupportedUrl,

    /// The requested format id is not offered for this item
    FormatUnavailable,

    Unknown,
}

impl FailureReason {
    /// Transient conditions; everything else is fatal for the item.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkTimeout | Self::ConnectionFailed | Self::Unknown)
    }

    /// Whether passing cookies could change the outcome
    pub fn cookies_might_help(&self) -> bool {
        matches!(
            self,
            Self::Http403Forbidden
                | Self::SabrStreaming
                | Self::PoTokenRequired
                | Self::AgeRestricted
                | Self::BotDetection
                | Self::PrivateVideo
                | Self::MembersOnly
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Http403Forbidden => "Access denied (HTTP 403)",
            Self::SabrStreaming => "SABR streaming protection active",
            Self::PoTokenRequired => "Proof of Origin token required",
            Self::AgeRestricted => "Age-restricted content",
            Self::GeoBlocked => "Geographic restriction",
            Self::NetworkTimeout => "Network timeout",
            Self::ConnectionFailed => "Connection failed",
            Self::RateLimited => "Rate limited by the remote service",
            Self::BotDetection => "Bot detection triggered",
            Self::PrivateVideo => "Private video",
            Self::VideoUnavailable => "Video unavailable",
            Self::DrmProtected => "DRM-protected content",
            Self::MembersOnly => "Members-only content",
            Self::UnsupportedUrl => "Unsupported URL",
            Self::FormatUnavailable => "Requested format is not available",
            Self::Unknown => "Unrecognized tool failure",
        }
    }
}

/// Reason plus the line that explains it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub reason: FailureReason,

    /// First `ERROR:`-looking line of the output, for logs
    pub context: Option<String>,

    pub matched_patterns: Vec<String>,
}

/// Pattern table, checked in order of specificity.
const RULES: &[(FailureReason, &[&str])] = &[
    (
        FailureReason::DrmProtected,
        &[
            "drm",
            "widevine",
            "playready",
            "fairplay",
            "encrypted media",
            "content is protected",
            "youtube premium",
            "requires purchase",
            "rental",
            "this video requires payment",
        ],
    ),
    (
        FailureReason::MembersOnly,
        &[
            "members only",
            "members-only",
            "join this channel",
            "membership required",
        ],
    ),
    (
        FailureReason::FormatUnavailable,
        &["requested format is not available", "no video formats found"],
    ),
    (
        FailureReason::UnsupportedUrl,
        &["unsupported url", "is not a valid url"],
    ),
    (FailureReason::SabrStreaming, &["sabr"]),
    (
        FailureReason::PoTokenRequired,
        &["po token", "proof of origin"],
    ),
    (
        FailureReason::AgeRestricted,
        &["age-restricted", "sign in to confirm your age", "age_verification"],
    ),
    (
        FailureReason::PrivateVideo,
        &[
            "private video",
            "video is private",
            "sign in if you've been granted access",
        ],
    ),
    (
        FailureReason::VideoUnavailable,
        &[
            "video unavailable",
            "video has been removed",
            "no longer available",
            "video is unavailable",
        ],
    ),
    (
        FailureReason::GeoBlocked,
        &[
            "not available in your country",
            "blocked in your country",
            "geo restrict",
            "geo-restrict",
        ],
    ),
    (
        FailureReason::RateLimited,
        &["http error 429", "rate limit", "too many requests"],
    ),
    (
        FailureReason::BotDetection,
        &["not a bot", "captcha", "unusual traffic"],
    ),
    (FailureReason::Http403Forbidden, &["403", "forbidden"]),
    (
        FailureReason::NetworkTimeout,
        &["timed out", "timeout"],
    ),
    (
        FailureReason::ConnectionFailed,
        &[
            "connection refused",
            "connection reset",
            "network is unreachable",
            "name or service not known",
            "temporary failure in name resolution",
            "getaddrinfo failed",
            "remote end closed connection",
        ],
    ),
];

/// Analyze an error message and return the matching reason
pub fn diagnose_error(error: &str) -> FailureReason {
    let lower = error.to_lowercase();

    RULES
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| lower.contains(p)))
        .map(|(reason, _)| *reason)
        .unwrap_or(FailureReason::Unknown)
}

/// Full diagnostic analysis of an error
pub fn analyze_error(error: &str) -> Diagnostics {
    let reason = diagnose_error(error);
    let lower = error.to_lowercase();

    let matched_patterns = RULES
        .iter()
        .flat_map(|(_, patterns)| patterns.iter())
        .filter(|p| lower.contains(*p))
        .map(|p| p.to_string())
        .collect();

    let context = error
        .lines()
        .map(str::trim)
        .find(|line| line.to_lowercase().starts_with("error:"))
        .map(str::to_string);

    Diagnostics {
        reason,
        context,
        matched_patterns,
    }
}
