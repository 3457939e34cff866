#![forbid(unsafe_code)]

//! Metadata sidecars written next to every completed download.
//!
//! One JSON file per output file, named `<output>.json`, written once after
//! success and removed together with its file on forced redownload. Writes
//! are atomic (tmp + rename) and best-effort: a failure warns on stderr and
//! never fails the job.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Full record for extractor-driven downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSidecar {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    pub id: String,
    pub format: String,
    pub quality_requested: String,
    pub downloaded_at: String,
    pub file_size: u64,
    pub method: String,
}

/// Slim record for files obtained by scraping a page directly; there is no
/// extractor metadata to carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeSidecar {
    pub url: String,
    pub downloaded_at: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Sidecar path for an output file: the full filename plus `.json`, so
/// `video_x_y_720.mp4` pairs with `video_x_y_720.mp4.json`.
pub fn path_for(media_path: &Path) -> PathBuf {
    let mut name = media_path.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

/// Best-effort write; failures only warn.
pub fn write<T: Serialize>(media_path: &Path, record: &T) {
    if let Err(err) = write_atomic(&path_for(media_path), record) {
        eprintln!(
            "Warning: could not write metadata sidecar for {}: {err}",
            media_path.display()
        );
    }
}

fn write_atomic<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(record)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("finalizing {}", path.display()))?;
    Ok(())
}

/// Best-effort removal of the sidecar paired with `media_path`.
pub fn remove(media_path: &Path) {
    let path = path_for(media_path);
    if path.exists()
        && let Err(err) = fs::remove_file(&path)
    {
        eprintln!(
            "Warning: could not remove metadata sidecar {}: {err}",
            path.display()
        );
    }
}
