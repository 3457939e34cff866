#![forbid(unsafe_code)]

//! Error taxonomy for download jobs.
//!
//! Everything that can terminate a job funnels into [`JobError`]; the
//! orchestrator converts the variant into a terminal progress record, so
//! nothing here ever propagates past the dispatcher boundary. Sidecar and
//! audit-log write failures are deliberately *not* represented: those are
//! best-effort and only warn on stderr.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    /// Malformed submission, rejected synchronously before a job exists.
    #[error("{0}")]
    InvalidRequest(String),

    /// Metadata resolution failed; the URL is unusable for this job.
    #[error("could not resolve media metadata: {0}")]
    Extraction(String),

    /// Every photo strategy was exhausted.
    #[error("no image URL found for this resource")]
    NoImageFound,

    /// Every video strategy was exhausted.
    #[error("no playable video found for this resource")]
    NoVideoFound,

    /// Retrieval failed after the one permitted relaxed retry.
    #[error("{0}")]
    Download(String),

    /// User-initiated abort, observed at a progress checkpoint.
    #[error("download cancelled by user")]
    Cancelled,
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}
