#![forbid(unsafe_code)]

//! The cache gate: decides whether an existing output file short-circuits a
//! job or gets cleared for a fresh retrieval.
//!
//! The deterministic output filename is the cache key, so presence on disk
//! is the entire check. Deletion of a stale file and its metadata sidecar is
//! best-effort: a failed unlink is reported but retrieval still proceeds.

use std::fs;
use std::path::Path;

use crate::sidecar;

#[derive(Debug, PartialEq, Eq)]
pub enum CacheDecision {
    /// The file exists and the policy honors it; complete the job with it.
    Skip { size: u64 },
    /// Retrieve fresh. `removed_bytes` is set when a stale file was cleared.
    ProceedFresh { removed_bytes: Option<u64> },
}

pub fn decide(path: &Path, honor_existing: bool) -> CacheDecision {
    let Ok(meta) = fs::metadata(path) else {
        return CacheDecision::ProceedFresh {
            removed_bytes: None,
        };
    };

    if honor_existing {
        return CacheDecision::Skip { size: meta.len() };
    }

    let removed = match fs::remove_file(path) {
        Ok(()) => Some(meta.len()),
        Err(err) => {
            eprintln!(
                "Warning: could not remove existing file {}: {err}",
                path.display()
            );
            None
        }
    };
    sidecar::remove(path);

    CacheDecision::ProceedFresh {
        removed_bytes: removed,
    }
}
