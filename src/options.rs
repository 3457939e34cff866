#![forbid(unsafe_code)]

//! Extraction options builder and error classification.
//!
//! `build_options` is a pure function of (format, quality, url, encoder
//! availability). The resulting [`ExtractionOptions`] is the only thing the
//! orchestrator hands to the extractor, so every site- and encoder-specific
//! decision is concentrated here and unit-testable without touching yt-dlp.
//!
//! Error classification is string matching over the failure message. That is
//! fragile by nature, so the concrete rules live in one table:
//!
//! | message contains (case-insensitive)        | class     |
//! |--------------------------------------------|-----------|
//! | "no video formats found"                   | Retryable |
//! | "unable to extract"                        | Retryable |
//! | anything else                              | Fatal     |

use crate::media::MediaFormat;

pub const AUDIO_CODEC: &str = "mp3";
pub const AUDIO_BITRATE: &str = "192";
const MERGE_CONTAINER: &str = "mp4";

/// Height ceilings for the recognized quality tiers.
const QUALITY_TIERS: &[(&str, u32)] = &[("1080", 1080), ("720", 720), ("480", 480), ("360", 360)];

/// Coarse source-site classes that change how we drive the extractor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SiteClass {
    /// Gets the strict avc1/m4a selector so merged output is broadly playable.
    Youtube,
    /// Streams commonly need container conversion; force a remux when we can.
    Tiktok,
    /// Scrape-friendly; also needs relaxed HLS/unplayable handling up front.
    Pinterest,
    Generic,
}

pub fn classify_site(url: &str) -> SiteClass {
    let lower = url.to_ascii_lowercase();
    if lower.contains("youtube.com") || lower.contains("youtu.be") {
        SiteClass::Youtube
    } else if lower.contains("tiktok.com") {
        SiteClass::Tiktok
    } else if lower.contains("pinterest.com") || lower.contains("pin.it") {
        SiteClass::Pinterest
    } else {
        SiteClass::Generic
    }
}

/// Audio postprocessing request; requires the external encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioTranscode {
    pub codec: &'static str,
    pub bitrate: &'static str,
}

/// Everything the extractor needs to know about one download attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractionOptions {
    /// yt-dlp format selector expression.
    pub format_selector: String,
    /// Merge separate video+audio streams into this container.
    pub merge_container: Option<&'static str>,
    /// Extract audio and transcode it after download.
    pub audio_transcode: Option<AudioTranscode>,
    /// Force a container remux after download.
    pub remux_container: Option<&'static str>,
    pub allow_unplayable: bool,
    pub prefer_native_hls: bool,
    /// Tolerate non-fatal sub-errors instead of aborting the whole job.
    pub ignore_nonfatal: bool,
}

impl ExtractionOptions {
    fn best_single() -> Self {
        Self {
            format_selector: "best".to_string(),
            merge_container: None,
            audio_transcode: None,
            remux_container: None,
            allow_unplayable: false,
            prefer_native_hls: false,
            ignore_nonfatal: false,
        }
    }

    /// The one permitted retry configuration: accept anything available,
    /// tolerate unplayable markers, keep HLS handling native, and ignore
    /// non-fatal sub-errors. Postprocessing requests are dropped because the
    /// relaxed pass exists precisely for sources whose formats the strict
    /// pass could not use.
    pub fn relaxed(&self) -> Self {
        Self {
            format_selector: "best".to_string(),
            merge_container: None,
            audio_transcode: self.audio_transcode.clone(),
            remux_container: None,
            allow_unplayable: true,
            prefer_native_hls: true,
            ignore_nonfatal: true,
        }
    }
}

fn tier_height(quality: &str) -> Option<u32> {
    QUALITY_TIERS
        .iter()
        .find(|(tier, _)| *tier == quality)
        .map(|(_, height)| *height)
}

/// Builds the options for the general extractor path.
///
/// Without the encoder we never request a merge of separate streams (it
/// would fail inside the extractor) and instead take the best single
/// already-combined file, sacrificing tier control. Audio without the
/// encoder falls back to the best single audio stream untranscoded.
pub fn build_options(
    format: MediaFormat,
    quality: &str,
    url: &str,
    encoder_available: bool,
) -> ExtractionOptions {
    let site = classify_site(url);

    let mut options = match format {
        MediaFormat::Audio => ExtractionOptions {
            format_selector: "bestaudio/best".to_string(),
            audio_transcode: encoder_available.then_some(AudioTranscode {
                codec: AUDIO_CODEC,
                bitrate: AUDIO_BITRATE,
            }),
            ..ExtractionOptions::best_single()
        },
        MediaFormat::Photo => ExtractionOptions::best_single(),
        MediaFormat::Video => video_options(site, quality, encoder_available),
    };

    if site == SiteClass::Pinterest {
        options.allow_unplayable = true;
        options.prefer_native_hls = true;
    }

    options
}

fn video_options(site: SiteClass, quality: &str, encoder_available: bool) -> ExtractionOptions {
    if !encoder_available {
        return ExtractionOptions::best_single();
    }

    match site {
        SiteClass::Tiktok => ExtractionOptions {
            format_selector: "bestvideo+bestaudio/best".to_string(),
            merge_container: Some(MERGE_CONTAINER),
            remux_container: Some(MERGE_CONTAINER),
            ..ExtractionOptions::best_single()
        },
        SiteClass::Youtube => {
            let selector = match tier_height(quality) {
                Some(height) => format!(
                    "bestvideo[height<={height}][ext=mp4][vcodec^=avc1]+bestaudio[ext=m4a]/best"
                ),
                None => "bestvideo+bestaudio/best".to_string(),
            };
            ExtractionOptions {
                format_selector: selector,
                merge_container: Some(MERGE_CONTAINER),
                ..ExtractionOptions::best_single()
            }
        }
        SiteClass::Pinterest | SiteClass::Generic => {
            let selector = match tier_height(quality) {
                Some(height) => {
                    format!("best[height<={height}]/bestvideo[height<={height}]+bestaudio/best")
                }
                None => "best".to_string(),
            };
            ExtractionOptions {
                format_selector: selector,
                merge_container: Some(MERGE_CONTAINER),
                ..ExtractionOptions::best_single()
            }
        }
    }
}

/// Whether a failed attempt earns the one relaxed retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

pub fn classify_extraction_error(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if lower.contains("no video formats found") || lower.contains("unable to extract") {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

/// Detects failures caused by the missing external encoder so the surfaced
/// message can carry remediation guidance.
pub fn mentions_missing_encoder(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("ffmpeg")
        || lower.contains("merging formats")
        || lower.contains("requested merging of multiple formats")
}
