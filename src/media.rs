#![forbid(unsafe_code)]

//! Request-side value types shared across the crate.

use serde::{Deserialize, Serialize};

use crate::error::JobError;

pub const DEFAULT_QUALITY: &str = "720";

/// Output kind requested by the user. Determines the retrieval strategies,
/// the postprocessing steps, and the deterministic output filename.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Video,
    Audio,
    Photo,
}

impl MediaFormat {
    pub fn parse(value: Option<&str>) -> Result<Self, JobError> {
        match value.map(|value| value.trim().to_ascii_lowercase()) {
            None => Ok(MediaFormat::Video),
            Some(ref value) if value.is_empty() || value == "video" => Ok(MediaFormat::Video),
            Some(ref value) if value == "audio" => Ok(MediaFormat::Audio),
            Some(ref value) if value == "photo" => Ok(MediaFormat::Photo),
            Some(value) => Err(JobError::InvalidRequest(format!(
                "unknown format: {value}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaFormat::Video => "video",
            MediaFormat::Audio => "audio",
            MediaFormat::Photo => "photo",
        }
    }
}

/// One user-initiated retrieval request. Immutable after submission; the
/// quality tier stays a raw string so unrecognized tiers still flow into the
/// output filename while the options builder falls back to unconstrained
/// best.
#[derive(Clone, Debug)]
pub struct JobRequest {
    pub url: String,
    pub format: MediaFormat,
    pub quality: String,
    /// Whoever asked for the download; only used for audit lines.
    pub client: String,
    /// Per-request override of the process-wide cache policy.
    pub honor_existing: Option<bool>,
}

impl JobRequest {
    pub fn new(url: impl Into<String>, format: MediaFormat) -> Self {
        Self {
            url: url.into(),
            format,
            quality: DEFAULT_QUALITY.to_string(),
            client: "unknown".to_string(),
            honor_existing: None,
        }
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = quality.into();
        self
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    pub fn with_honor_existing(mut self, honor: bool) -> Self {
        self.honor_existing = Some(honor);
        self
    }
}
