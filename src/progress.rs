#![forbid(unsafe_code)]

//! Process-wide job progress and cancellation state.
//!
//! Both stores are mutex-guarded maps keyed by job id. The discipline is
//! single-writer-per-key: only the worker running a job writes its entry,
//! with one exception, the cancellation handler, which may override any
//! non-`completed` state. Writers go through [`ProgressTracker::update_if_active`]
//! so a completion or error arriving after a cancel can never resurrect a
//! job the caller already saw terminate.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::media::MediaFormat;

/// Verdict returned by a progress hook at each checkpoint. Strategies must
/// honor `Abort` promptly; it is the only way cancellation reaches a running
/// download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressSignal {
    Continue,
    Abort,
}

/// Callback invoked by strategies at every checkpoint with the current
/// percent (0–100; zero when the total size is unknown).
pub type ProgressFn<'a> = &'a (dyn Fn(f64) -> ProgressSignal + Send + Sync);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Downloading,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// Snapshot of one job as seen by pollers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobProgress {
    pub progress: f64,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<MediaFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgress {
    pub fn waiting() -> Self {
        Self {
            progress: 0.0,
            status: JobStatus::Waiting,
            filename: None,
            format: None,
            error: None,
        }
    }

    pub fn downloading(percent: f64) -> Self {
        Self {
            progress: percent.clamp(0.0, 100.0),
            status: JobStatus::Downloading,
            ..Self::waiting()
        }
    }

    pub fn processing() -> Self {
        Self {
            progress: 100.0,
            status: JobStatus::Processing,
            ..Self::waiting()
        }
    }

    pub fn completed(filename: String, format: MediaFormat) -> Self {
        Self {
            progress: 100.0,
            status: JobStatus::Completed,
            filename: Some(filename),
            format: Some(format),
            error: None,
        }
    }

    /// Error records reset the percent to zero so pollers render a clean
    /// failed state instead of a stuck bar.
    pub fn failed(message: String) -> Self {
        Self {
            progress: 0.0,
            status: JobStatus::Error,
            filename: None,
            format: None,
            error: Some(message),
        }
    }
}

/// Shared mapping from job id to its latest progress snapshot. Entries live
/// for the process lifetime; there is no eviction in this design.
#[derive(Default)]
pub struct ProgressTracker {
    entries: Mutex<HashMap<String, JobProgress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot, or a default `waiting` entry for unknown ids.
    pub fn snapshot(&self, job_id: &str) -> JobProgress {
        self.entries
            .lock()
            .get(job_id)
            .cloned()
            .unwrap_or_else(JobProgress::waiting)
    }

    /// Writes the entry unless the job already reached a terminal state.
    /// Returns whether the write happened.
    pub fn update_if_active(&self, job_id: &str, progress: JobProgress) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(job_id) {
            Some(existing) if existing.status.is_terminal() => false,
            _ => {
                entries.insert(job_id.to_string(), progress);
                true
            }
        }
    }

    /// The cancellation override: forces the entry to a cancelled error
    /// unless the job already completed. A `completed` record is the one
    /// terminal state cancel must never disturb.
    pub fn override_with_cancel(&self, job_id: &str) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(job_id)
            && existing.status == JobStatus::Completed
        {
            return;
        }
        entries.insert(
            job_id.to_string(),
            JobProgress::failed(JobError::Cancelled.to_string()),
        );
    }
}

/// Set of job ids flagged for cancellation. Flags are set once and never
/// cleared; the active strategy polls this at every progress checkpoint.
#[derive(Default)]
pub struct CancellationRegistry {
    flags: Mutex<HashSet<String>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, job_id: &str) {
        self.flags.lock().insert(job_id.to_string());
    }

    pub fn is_cancelled(&self, job_id: &str) -> bool {
        self.flags.lock().contains(job_id)
    }
}
