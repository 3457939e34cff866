#![forbid(unsafe_code)]

//! Append-only audit log of download activity.
//!
//! One human-readable line per event, prefixed with an ISO-8601 timestamp.
//! Writes are best-effort; a failed append warns on stderr and never affects
//! the job that produced the event.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

#[derive(Clone, Debug)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, message: &str) {
        let line = format!("[{}] {message}\n", Utc::now().to_rfc3339());
        if let Err(err) = self.append(&line) {
            eprintln!("Warning: could not write audit log entry: {err}");
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}
