#![forbid(unsafe_code)]

//! Direct page scraping for sites the general extractor resolves poorly.
//!
//! The heuristics mirror how image/video hosts embed their media: an
//! OpenGraph meta tag first, then structured embedded JSON, then tagged or
//! generic elements. Matching is pure string work over the fetched markup so
//! it stays unit-testable; the network side lives behind [`PageScraper`].

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::JobError;
use crate::progress::{ProgressFn, ProgressSignal};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";
const FETCH_CHUNK: usize = 8192;

/// Hosts whose pages we know how to scrape directly.
pub fn is_scrape_friendly(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains("pinterest.com") || lower.contains("pin.it")
}

static OG_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta[^>]+property=["']og:image["'][^>]+content=["']([^"']+)["']"#).unwrap()
});
static JSON_IMAGES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""images":\s*\[\s*\{[^}]*"url":"([^"]+)""#).unwrap());
static PIN_IMAGE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img[^>]+src=["']([^"']+)["'][^>]*class=["'][^"']*pinImage[^"']*["']"#)
        .unwrap()
});
static ANY_IMAGE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<img[^>]+src=["']([^"']+)["']"#).unwrap());

static OG_VIDEO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta[^>]+property=["']og:video(?::secure_url)?["'][^>]+content=["']([^"']+)["']"#)
        .unwrap()
});
static VIDEO_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<video[^>]+src=["']([^"']+)["']"#).unwrap());
static JSON_PLAYABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""playable_url":"([^"]+)""#).unwrap());
static JSON_CONTENT_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""contentUrl":"([^"]+)""#).unwrap());

/// URLs embedded in JSON carry escaped separators; undo the common ones.
fn unescape_embedded(url: &str) -> String {
    url.replace("\\u0026", "&").replace("\\/", "/")
}

fn first_capture(patterns: &[&LazyLock<Regex>], html: &str) -> Option<String> {
    for pattern in patterns {
        if let Some(captures) = pattern.captures(html) {
            return Some(unescape_embedded(&captures[1]));
        }
    }
    None
}

/// Ordered image heuristics: structured meta tag, embedded-JSON image list,
/// tagged pin image element, then any image element at all.
pub fn extract_image_url(html: &str) -> Option<String> {
    first_capture(&[&OG_IMAGE, &JSON_IMAGES, &PIN_IMAGE_TAG, &ANY_IMAGE_TAG], html)
}

/// Ordered video heuristics: structured meta tag, a video element, then the
/// embedded-JSON `playable_url` and `contentUrl` fields.
pub fn extract_video_url(html: &str) -> Option<String> {
    first_capture(&[&OG_VIDEO, &VIDEO_TAG, &JSON_PLAYABLE, &JSON_CONTENT_URL], html)
}

/// Network capability used by the scraping strategies. Blocking; callers run
/// it inside `spawn_blocking`.
pub trait PageScraper: Send + Sync {
    /// Fetches the page and applies the image heuristics.
    fn scrape_image_url(&self, page_url: &str) -> Option<String>;

    /// Fetches the page and applies the video heuristics.
    fn scrape_video_url(&self, page_url: &str) -> Option<String>;

    /// Streams a media URL to disk, reporting byte-level progress at each
    /// chunk. Returns the byte count written.
    fn fetch_to_file(
        &self,
        media_url: &str,
        dest: &Path,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, JobError>;
}

/// Production scraper backed by a shared blocking HTTP agent.
pub struct HttpScraper {
    agent: ureq::Agent,
}

impl Default for HttpScraper {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpScraper {
    pub fn new() -> Self {
        let agent = ureq::builder()
            .timeout_connect(Duration::from_secs(15))
            .timeout_read(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build();
        Self { agent }
    }

    fn fetch_page(&self, page_url: &str) -> Option<String> {
        match self.agent.get(page_url).call() {
            Ok(response) => response.into_string().ok(),
            Err(err) => {
                eprintln!("Warning: page fetch failed for {page_url}: {err}");
                None
            }
        }
    }
}

impl PageScraper for HttpScraper {
    fn scrape_image_url(&self, page_url: &str) -> Option<String> {
        self.fetch_page(page_url)
            .as_deref()
            .and_then(extract_image_url)
    }

    fn scrape_video_url(&self, page_url: &str) -> Option<String> {
        self.fetch_page(page_url)
            .as_deref()
            .and_then(extract_video_url)
    }

    fn fetch_to_file(
        &self,
        media_url: &str,
        dest: &Path,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, JobError> {
        let response = self
            .agent
            .get(media_url)
            .call()
            .map_err(|err| JobError::Download(format!("fetching {media_url}: {err}")))?;

        let total: Option<u64> = response
            .header("Content-Length")
            .and_then(|value| value.parse().ok());

        let mut reader = response.into_reader();
        let mut file = File::create(dest)
            .map_err(|err| JobError::Download(format!("creating {}: {err}", dest.display())))?;

        let mut written = 0u64;
        let mut buf = [0u8; FETCH_CHUNK];
        loop {
            let read = reader
                .read(&mut buf)
                .map_err(|err| JobError::Download(format!("reading {media_url}: {err}")))?;
            if read == 0 {
                break;
            }
            file.write_all(&buf[..read])
                .map_err(|err| JobError::Download(format!("writing {}: {err}", dest.display())))?;
            written += read as u64;

            let percent = total
                .filter(|total| *total > 0)
                .map(|total| (written as f64 / total as f64) * 100.0)
                .unwrap_or(0.0);
            if on_progress(percent) == ProgressSignal::Abort {
                drop(file);
                let _ = std::fs::remove_file(dest);
                return Err(JobError::Cancelled);
            }
        }

        file.flush()
            .map_err(|err| JobError::Download(format!("flushing {}: {err}", dest.display())))?;
        Ok(written)
    }
}
