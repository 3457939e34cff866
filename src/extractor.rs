#![forbid(unsafe_code)]

//! Wrapper around the external `yt-dlp` extractor binary.
//!
//! Everything here is blocking (child processes, pipe reads); the dispatcher
//! runs these calls inside `spawn_blocking`. Progress is parsed from the
//! extractor's own `[download]  42.0%` lines on stdout, and the child is
//! killed mid-transfer when the progress hook asks for an abort.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::JobError;
use crate::options::ExtractionOptions;
use crate::progress::{ProgressFn, ProgressSignal};

/// Metadata resolved for a URL before anything is transferred.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thumbnail {
    #[serde(default)]
    pub url: Option<String>,
}

impl MediaInfo {
    /// Best thumbnail URL: the top-level field, else the last listed entry
    /// (extractors order thumbnail variants smallest first).
    pub fn best_thumbnail(&self) -> Option<&str> {
        self.thumbnail
            .as_deref()
            .or_else(|| self.thumbnails.iter().rev().find_map(|t| t.url.as_deref()))
    }
}

/// Extraction capability used by the dispatcher. Implementations are
/// blocking; callers run them inside `spawn_blocking`.
pub trait MediaExtractor: Send + Sync {
    /// Resolves metadata for a URL without downloading anything.
    fn extract_metadata(&self, url: &str) -> Result<MediaInfo, JobError>;

    /// Downloads `url` to `output_stem` plus an extractor-chosen extension,
    /// invoking `on_progress` with each reported percent.
    fn download(
        &self,
        url: &str,
        output_stem: &Path,
        options: &ExtractionOptions,
        on_progress: ProgressFn<'_>,
    ) -> Result<(), JobError>;
}

static PROGRESS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%").unwrap());

/// Production extractor shelling out to `yt-dlp`.
pub struct YtDlp {
    binary: PathBuf,
    encoder_dir: Option<PathBuf>,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>, encoder_dir: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            encoder_dir,
        }
    }

    fn download_args(&self, url: &str, output_stem: &Path, options: &ExtractionOptions) -> Vec<String> {
        let mut args = vec!["-f".to_string(), options.format_selector.clone()];
        if let Some(container) = &options.merge_container {
            args.push("--merge-output-format".to_string());
            args.push(container.to_string());
        }
        if let Some(transcode) = &options.audio_transcode {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push(transcode.codec.to_string());
            args.push("--audio-quality".to_string());
            args.push(transcode.bitrate.to_string());
        }
        if let Some(container) = &options.remux_container {
            args.push("--remux-video".to_string());
            args.push(container.to_string());
        }
        if options.allow_unplayable {
            args.push("--allow-unplayable-formats".to_string());
        }
        if options.prefer_native_hls {
            args.push("--hls-prefer-native".to_string());
        }
        if options.ignore_nonfatal {
            args.push("--ignore-errors".to_string());
        }
        if let Some(dir) = &self.encoder_dir {
            args.push("--ffmpeg-location".to_string());
            args.push(dir.to_string_lossy().into_owned());
        }
        args.push("-o".to_string());
        args.push(format!("{}.%(ext)s", output_stem.display()));
        args.push("--newline".to_string());
        args.push("--no-warnings".to_string());
        args.push("--no-part".to_string());
        args.push(url.to_string());
        args
    }
}

impl MediaExtractor for YtDlp {
    fn extract_metadata(&self, url: &str) -> Result<MediaInfo, JobError> {
        let output = Command::new(&self.binary)
            .args([
                "--dump-single-json",
                "--skip-download",
                "--no-warnings",
                "--no-progress",
                url,
            ])
            .stdin(Stdio::null())
            .output()
            .map_err(|err| JobError::Extraction(format!("spawning extractor: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(JobError::Extraction(error_tail(&stderr)));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|err| JobError::Extraction(format!("parsing metadata: {err}")))
    }

    fn download(
        &self,
        url: &str,
        output_stem: &Path,
        options: &ExtractionOptions,
        on_progress: ProgressFn<'_>,
    ) -> Result<(), JobError> {
        let mut child = Command::new(&self.binary)
            .args(self.download_args(url, output_stem, options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| JobError::Download(format!("spawning extractor: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::Download("extractor stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobError::Download("extractor stderr unavailable".to_string()))?;

        // Drain stderr on a side thread so the child never blocks on a full
        // pipe; the collected text feeds the error message on failure.
        let stderr_thread = std::thread::spawn(move || {
            let mut collected = String::new();
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        });

        let mut aborted = false;
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if let Some(captures) = PROGRESS_LINE.captures(&line) {
                if let Ok(percent) = captures[1].parse::<f64>() {
                    if on_progress(percent) == ProgressSignal::Abort {
                        aborted = true;
                        let _ = child.kill();
                        break;
                    }
                }
            }
        }

        let status = child
            .wait()
            .map_err(|err| JobError::Download(format!("waiting for extractor: {err}")))?;
        let stderr_text = stderr_thread.join().unwrap_or_default();

        if aborted {
            return Err(JobError::Cancelled);
        }
        if !status.success() {
            return Err(JobError::Download(error_tail(&stderr_text)));
        }
        Ok(())
    }
}

/// Last few stderr lines, which is where the extractor puts its actual
/// complaint; full transcripts can run to hundreds of fragment lines.
fn error_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let tail = lines.len().saturating_sub(4);
    let text = lines[tail..].join("\n");
    if text.is_empty() {
        "extractor failed without diagnostics".to_string()
    } else {
        text
    }
}
