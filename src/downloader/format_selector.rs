// FormatResolver - picks the streams a DownloadJob fetches
//
// Policy:
// - Video: highest resolution, then codec compatibility (H.264 > VP9 > AV1),
//   then total bitrate, then size, then format id
// - Audio: highest bitrate, then AAC over other codecs, then size, then format id
// - Combined variants fill in for a missing split subset, and are returned
//   directly when the catalog has no split variants at all
//
// Every comparison ends on the format id, so the pick never depends on
// catalog order.

use serde::Serialize;
use std::cmp::Ordering;

use super::errors::JobError;
use super::models::{FormatCatalog, MediaKind, StreamVariant};

/// What the DownloadJob has to fetch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Selection {
    /// Separate video and audio streams, merged afterwards
    Split {
        video: StreamVariant,
        audio: StreamVariant,
    },
    /// One combined stream, no merge needed
    Single(StreamVariant),
}

impl Selection {
    pub fn describe(&self) -> String {
        match self {
            Self::Split { video, audio } => format!(
                "{} + {}",
                FormatResolver::video_label(video),
                FormatResolver::audio_label(audio)
            ),
            Self::Single(v) => format!("{} (combined)", FormatResolver::video_label(v)),
        }
    }
}

pub struct FormatResolver;

impl FormatResolver {
    /// Pure function of the catalog
    pub fn resolve(catalog: &FormatCatalog) -> Result<Selection, JobError> {
        let of_kind = |kind: MediaKind| -> Vec<&StreamVariant> {
            catalog.variants.iter().filter(|v| v.kind == kind).collect()
        };
        let video_only = of_kind(MediaKind::VideoOnly);
        let audio_only = of_kind(MediaKind::AudioOnly);
        let combined = of_kind(MediaKind::Combined);

        if video_only.is_empty() && audio_only.is_empty() {
            return Self::best_video(&combined)
                .map(|v| Selection::Single(v.clone()))
                .ok_or_else(|| {
                    JobError::NoCompatibleFormat(format!(
                        "'{}' offers no video or audio streams",
                        catalog.title
                    ))
                });
        }

        let video = Self::best_video(&video_only).or_else(|| Self::best_video(&combined));
        let audio = Self::best_audio(&audio_only).or_else(|| Self::best_audio(&combined));

        match (video, audio) {
            (Some(video), Some(audio)) => Ok(Selection::Split {
                video: video.clone(),
                audio: audio.clone(),
            }),
            (None, _) => Err(JobError::NoCompatibleFormat(format!(
                "'{}' has no video stream",
                catalog.title
            ))),
            (_, None) => Err(JobError::NoCompatibleFormat(format!(
                "'{}' has no audio stream",
                catalog.title
            ))),
        }
    }

    fn best_video<'a>(formats: &[&'a StreamVariant]) -> Option<&'a StreamVariant> {
        formats.iter().copied().max_by(|a, b| Self::compare_video(a, b))
    }

    fn best_audio<'a>(formats: &[&'a StreamVariant]) -> Option<&'a StreamVariant> {
        formats.iter().copied().max_by(|a, b| Self::compare_audio(a, b))
    }

    /// Greater means preferred
    fn compare_video(a: &StreamVariant, b: &StreamVariant) -> Ordering {
        a.height
            .unwrap_or(0)
            .cmp(&b.height.unwrap_or(0))
            .then_with(|| Self::codec_rank(a).cmp(&Self::codec_rank(b)))
            .then_with(|| total_cmp_f32(a.tbr, b.tbr))
            .then_with(|| a.effective_size().cmp(&b.effective_size()))
            // lower id wins the final tie
            .then_with(|| b.id.cmp(&a.id))
    }

    fn compare_audio(a: &StreamVariant, b: &StreamVariant) -> Ordering {
        a.audio_bitrate()
            .total_cmp(&b.audio_bitrate())
            .then_with(|| a.is_aac().cmp(&b.is_aac()))
            .then_with(|| a.effective_size().cmp(&b.effective_size()))
            .then_with(|| b.id.cmp(&a.id))
    }

    /// Broad playback compatibility of the video codec
    fn codec_rank(format: &StreamVariant) -> u8 {
        if format.is_h264() {
            3
        } else if format.is_vp9() {
            2
        } else if format.is_av1() {
            1
        } else {
            0
        }
    }

    /// Get human-readable codec label
    fn codec_label(format: &StreamVariant) -> String {
        if format.is_h264() {
            "H.264".to_string()
        } else if format.is_vp9() {
            "VP9".to_string()
        } else if format.is_av1() {
            "AV1".to_string()
        } else {
            format
                .vcodec
                .as_deref()
                .map(|v| v.split('.').next().unwrap_or(v).to_string())
                .unwrap_or_else(|| "unknown".to_string())
        }
    }

    pub fn video_label(format: &StreamVariant) -> String {
        match format.height {
            Some(h) => format!("{}p {}", h, Self::codec_label(format)),
            None => Self::codec_label(format),
        }
    }

    pub fn audio_label(format: &StreamVariant) -> String {
        let codec = if format.is_aac() {
            "AAC".to_string()
        } else {
            format
                .acodec
                .as_deref()
                .map(|a| a.split('.').next().unwrap_or(a).to_string())
                .unwrap_or_else(|| "audio".to_string())
        };
        let kbps = format.audio_bitrate();
        if kbps > 0.0 {
            format!("{:.0}kbps {}", kbps, codec)
        } else {
            codec
        }
    }

    /// Format file size for display
    pub fn format_size(bytes: Option<u64>) -> Option<String> {
        bytes.map(|b| {
            let mb = b as f64 / 1_048_576.0;
            if mb >= 1024.0 {
                format!("{:.1} GB", mb / 1024.0)
            } else {
                format!("{:.0} MB", mb)
            }
        })
    }
}

fn total_cmp_f32(a: Option<f32>, b: Option<f32>) -> Ordering {
    a.unwrap_or(0.0).total_cmp(&b.unwrap_or(0.0))
}
