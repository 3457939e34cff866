#![forbid(unsafe_code)]

//! Job dispatch and orchestration.
//!
//! Each accepted request becomes one spawned task that runs the full
//! pipeline: metadata resolution, deterministic naming, the cache gate, the
//! layered retrieval strategies, sidecar and audit writes, and the final
//! progress transition. Blocking work (the extractor child process, page
//! fetches) runs inside `spawn_blocking`; everything the HTTP layer touches
//! goes through the shared [`ProgressTracker`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::audit::AuditLog;
use crate::cache::{self, CacheDecision};
use crate::encoder;
use crate::error::JobError;
use crate::extractor::{MediaExtractor, MediaInfo};
use crate::identity::{MediaIdentity, output_filename};
use crate::media::{JobRequest, MediaFormat};
use crate::options::{
    self, ErrorClass, ExtractionOptions, build_options, classify_extraction_error,
};
use crate::progress::{
    CancellationRegistry, JobProgress, ProgressSignal, ProgressTracker,
};
use crate::scrape::{PageScraper, is_scrape_friendly};
use crate::sidecar::{self, MediaSidecar, ScrapeSidecar};

/// Cheap handle over the shared dispatcher state. Clones share one inner.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    extractor: Arc<dyn MediaExtractor>,
    scraper: Arc<dyn PageScraper>,
    tracker: ProgressTracker,
    cancellations: CancellationRegistry,
    downloads_root: PathBuf,
    audit: AuditLog,
    honor_existing_default: bool,
    encoder_available: bool,
    counter: AtomicUsize,
    /// One async mutex per in-flight output filename so two jobs that
    /// resolve to the same file never race on the cache gate or the write.
    in_flight: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        extractor: Arc<dyn MediaExtractor>,
        scraper: Arc<dyn PageScraper>,
        downloads_root: PathBuf,
        audit: AuditLog,
        honor_existing_default: bool,
        encoder_available: bool,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                extractor,
                scraper,
                tracker: ProgressTracker::new(),
                cancellations: CancellationRegistry::new(),
                downloads_root,
                audit,
                honor_existing_default,
                encoder_available,
                counter: AtomicUsize::new(1),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validates the request, registers a fresh job id, and spawns the
    /// pipeline. Returns immediately with the id the client polls.
    pub fn submit(&self, request: JobRequest) -> Result<String, JobError> {
        let url = request.url.trim();
        if url.is_empty() {
            return Err(JobError::InvalidRequest("missing url".to_string()));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(JobError::InvalidRequest(format!(
                "unsupported url scheme in {url}"
            )));
        }

        let job_id = format!("job-{}", self.inner.counter.fetch_add(1, Ordering::SeqCst));
        self.inner
            .tracker
            .update_if_active(&job_id, JobProgress::waiting());
        self.inner.audit.record(&format!(
            "SUBMIT {job_id} client={} format={} quality={} url={}",
            request.client,
            request.format.as_str(),
            request.quality,
            url
        ));

        let inner = self.inner.clone();
        let id_for_task = job_id.clone();
        tokio::spawn(async move {
            run_job(inner, id_for_task, request).await;
        });
        Ok(job_id)
    }

    /// Flags a job for cancellation and force-fails its visible state.
    /// Idempotent; unknown ids are flagged the same way so a submit racing
    /// this cancel still observes the flag.
    pub fn cancel(&self, job_id: &str) {
        self.inner.cancellations.request(job_id);
        self.inner.tracker.override_with_cancel(job_id);
        self.inner.audit.record(&format!("CANCEL {job_id}"));
    }

    /// Latest progress snapshot; unknown ids read as `waiting` at zero.
    pub fn poll(&self, job_id: &str) -> JobProgress {
        self.inner.tracker.snapshot(job_id)
    }
}

async fn run_job(inner: Arc<DispatcherInner>, job_id: String, request: JobRequest) {
    match orchestrate(&inner, &job_id, &request).await {
        Ok(filename) => {
            inner.audit.record(&format!(
                "SUCCESS {job_id} client={} file={filename} url={}",
                request.client, request.url
            ));
        }
        Err(err) => {
            let mut message = err.to_string();
            if !inner.encoder_available && options::mentions_missing_encoder(&message) {
                message = format!("{message}. {}", encoder::remediation_hint());
            }
            inner
                .tracker
                .update_if_active(&job_id, JobProgress::failed(message.clone()));
            inner.audit.record(&format!(
                "ERROR {job_id} client={} url={} error={message}",
                request.client, request.url
            ));
        }
    }
}

/// The full pipeline for one job. Returns the final output filename.
async fn orchestrate(
    inner: &Arc<DispatcherInner>,
    job_id: &str,
    request: &JobRequest,
) -> Result<String, JobError> {
    let info = resolve_metadata(inner, job_id, request).await?;
    ensure_active(inner, job_id)?;

    let identity = match &info {
        Some(info) => MediaIdentity::new(
            info.id.clone().unwrap_or_else(|| job_id.to_string()),
            info.title.as_deref().unwrap_or(""),
        ),
        None => MediaIdentity::new(job_id.to_string(), ""),
    };
    let filename = output_filename(request.format, &identity, &request.quality);
    let path = inner.downloads_root.join(&filename);

    let gate = filename_gate(inner, &path);
    let guard = gate.lock().await;

    let honor = request
        .honor_existing
        .unwrap_or(inner.honor_existing_default);
    match cache::decide(&path, honor) {
        CacheDecision::Skip { size } => {
            inner
                .audit
                .record(&format!("SKIP {job_id} file={filename} size={size}"));
            inner.tracker.update_if_active(
                job_id,
                JobProgress::completed(filename.clone(), request.format),
            );
            drop(guard);
            release_gate(inner, &path, &gate);
            return Ok(filename);
        }
        CacheDecision::ProceedFresh {
            removed_bytes: Some(bytes),
        } => {
            inner
                .audit
                .record(&format!("REDOWNLOAD {job_id} file={filename} cleared={bytes}"));
        }
        CacheDecision::ProceedFresh { removed_bytes: None } => {}
    }

    inner
        .tracker
        .update_if_active(job_id, JobProgress::downloading(0.0));

    let result = retrieve(inner, job_id, request, info.as_ref(), &identity, &path).await;
    drop(guard);
    release_gate(inner, &path, &gate);
    let final_path = result?;

    let final_name = final_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or(filename);
    inner.tracker.update_if_active(
        job_id,
        JobProgress::completed(final_name.clone(), request.format),
    );
    Ok(final_name)
}

/// Resolves extractor metadata. Scrape-friendly photo and video URLs may
/// proceed without it; everything else treats a metadata failure as fatal.
async fn resolve_metadata(
    inner: &Arc<DispatcherInner>,
    job_id: &str,
    request: &JobRequest,
) -> Result<Option<MediaInfo>, JobError> {
    ensure_active(inner, job_id)?;
    let extractor = inner.extractor.clone();
    let url = request.url.clone();
    let outcome = tokio::task::spawn_blocking(move || extractor.extract_metadata(&url))
        .await
        .map_err(|err| JobError::Extraction(format!("metadata task failed: {err}")))?;

    match outcome {
        Ok(info) => Ok(Some(info)),
        Err(err) if err.is_cancelled() => Err(err),
        Err(err) => {
            let scrapable = request.format != MediaFormat::Audio && is_scrape_friendly(&request.url);
            if scrapable {
                // The page scrape strategies can still produce a file.
                Ok(None)
            } else {
                Err(err)
            }
        }
    }
}

/// Runs the format-specific strategy chain and writes the sidecar. Returns
/// the path of the file that actually landed on disk.
async fn retrieve(
    inner: &Arc<DispatcherInner>,
    job_id: &str,
    request: &JobRequest,
    info: Option<&MediaInfo>,
    identity: &MediaIdentity,
    path: &Path,
) -> Result<PathBuf, JobError> {
    match request.format {
        MediaFormat::Photo => retrieve_photo(inner, job_id, request, info, path).await,
        MediaFormat::Video | MediaFormat::Audio => {
            if request.format == MediaFormat::Video && is_scrape_friendly(&request.url) {
                if let Some(final_path) =
                    try_scraped_video(inner, job_id, request, path).await?
                {
                    return Ok(final_path);
                }
            }
            retrieve_with_extractor(inner, job_id, request, info, identity, path).await
        }
    }
}

/// Photo strategy chain: extractor thumbnail first, then a page scrape on
/// supported hosts.
async fn retrieve_photo(
    inner: &Arc<DispatcherInner>,
    job_id: &str,
    request: &JobRequest,
    info: Option<&MediaInfo>,
    path: &Path,
) -> Result<PathBuf, JobError> {
    if let Some(thumbnail) = info.and_then(MediaInfo::best_thumbnail) {
        let size = fetch_media(inner, job_id, thumbnail, path).await?;
        ensure_active(inner, job_id)?;
        sidecar::write(
            path,
            &MediaSidecar {
                url: request.url.clone(),
                title: info.and_then(|i| i.title.clone()),
                uploader: info.and_then(|i| i.uploader.clone()),
                id: info.and_then(|i| i.id.clone()).unwrap_or_else(|| job_id.to_string()),
                format: request.format.as_str().to_string(),
                quality_requested: request.quality.clone(),
                downloaded_at: sidecar::now_iso(),
                file_size: size,
                method: "thumbnail".to_string(),
            },
        );
        return Ok(path.to_path_buf());
    }

    if is_scrape_friendly(&request.url) {
        let scraper = inner.scraper.clone();
        let page_url = request.url.clone();
        let found = tokio::task::spawn_blocking(move || scraper.scrape_image_url(&page_url))
            .await
            .map_err(|err| JobError::Download(format!("scrape task failed: {err}")))?;
        if let Some(image_url) = found {
            let _ = fetch_media(inner, job_id, &image_url, path).await?;
            ensure_active(inner, job_id)?;
            sidecar::write(
                path,
                &ScrapeSidecar {
                    url: request.url.clone(),
                    downloaded_at: sidecar::now_iso(),
                    method: "page-scrape".to_string(),
                    source_image: Some(image_url),
                },
            );
            return Ok(path.to_path_buf());
        }
    }

    Err(JobError::NoImageFound)
}

/// Direct-scrape video strategy for supported hosts. `Ok(None)` means the
/// page exposed nothing and the extractor path should run instead.
async fn try_scraped_video(
    inner: &Arc<DispatcherInner>,
    job_id: &str,
    request: &JobRequest,
    path: &Path,
) -> Result<Option<PathBuf>, JobError> {
    let scraper = inner.scraper.clone();
    let page_url = request.url.clone();
    let found = tokio::task::spawn_blocking(move || scraper.scrape_video_url(&page_url))
        .await
        .map_err(|err| JobError::Download(format!("scrape task failed: {err}")))?;
    let Some(video_url) = found else {
        return Ok(None);
    };

    let _ = fetch_media(inner, job_id, &video_url, path).await?;
    ensure_active(inner, job_id)?;
    sidecar::write(
        path,
        &ScrapeSidecar {
            url: request.url.clone(),
            downloaded_at: sidecar::now_iso(),
            method: "page-scrape".to_string(),
            source_image: None,
        },
    );
    Ok(Some(path.to_path_buf()))
}

/// The general extractor strategy with its one relaxed retry.
async fn retrieve_with_extractor(
    inner: &Arc<DispatcherInner>,
    job_id: &str,
    request: &JobRequest,
    info: Option<&MediaInfo>,
    identity: &MediaIdentity,
    path: &Path,
) -> Result<PathBuf, JobError> {
    if info.is_none() {
        // Metadata already failed and the scrape path found nothing.
        return Err(JobError::NoVideoFound);
    }

    let options = build_options(
        request.format,
        &request.quality,
        &request.url,
        inner.encoder_available,
    );
    let stem = path.with_extension("");

    // One high-water mark across both attempts: the relaxed retry starts its
    // own transfer from zero percent, but the polled value must not regress
    // on a job that still ends up completing.
    let high_water = Arc::new(Mutex::new(0.0f64));

    let mut method = "extractor";
    if let Err(err) =
        run_extractor(inner, job_id, request, &stem, options.clone(), &high_water).await
    {
        if err.is_cancelled() {
            return Err(err);
        }
        if classify_extraction_error(&err.to_string()) != ErrorClass::Retryable {
            return Err(err);
        }
        ensure_active(inner, job_id)?;
        method = "extractor-relaxed";
        run_extractor(inner, job_id, request, &stem, options.relaxed(), &high_water).await?;
    }

    ensure_active(inner, job_id)?;
    inner
        .tracker
        .update_if_active(job_id, JobProgress::processing());

    let final_path = find_output_file(path).ok_or_else(|| {
        JobError::Download("extractor reported success but produced no output file".to_string())
    })?;
    let size = fs::metadata(&final_path).map(|meta| meta.len()).unwrap_or(0);

    sidecar::write(
        &final_path,
        &MediaSidecar {
            url: request.url.clone(),
            title: info.and_then(|i| i.title.clone()),
            uploader: info.and_then(|i| i.uploader.clone()),
            id: identity.content_id.clone(),
            format: request.format.as_str().to_string(),
            quality_requested: request.quality.clone(),
            downloaded_at: sidecar::now_iso(),
            file_size: size,
            method: method.to_string(),
        },
    );
    Ok(final_path)
}

async fn run_extractor(
    inner: &Arc<DispatcherInner>,
    job_id: &str,
    request: &JobRequest,
    stem: &Path,
    options: ExtractionOptions,
    high_water: &Arc<Mutex<f64>>,
) -> Result<(), JobError> {
    let inner_for_hook = inner.clone();
    let job_id_owned = job_id.to_string();
    let url = request.url.clone();
    let stem = stem.to_path_buf();
    let high_water = high_water.clone();
    tokio::task::spawn_blocking(move || {
        // Separate audio and video passes each restart at zero percent, so
        // only forward movement reaches the tracker.
        let hook = |percent: f64| {
            report_progress(&inner_for_hook, &job_id_owned, &high_water, percent)
        };
        inner_for_hook
            .extractor
            .download(&url, &stem, &options, &hook)
    })
    .await
    .map_err(|err| JobError::Download(format!("download task failed: {err}")))?
}

/// Streams a direct media URL to `dest` with progress and abort support.
async fn fetch_media(
    inner: &Arc<DispatcherInner>,
    job_id: &str,
    media_url: &str,
    dest: &Path,
) -> Result<u64, JobError> {
    ensure_active(inner, job_id)?;
    let inner_for_hook = inner.clone();
    let job_id_owned = job_id.to_string();
    let media_url = media_url.to_string();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let high_water = Mutex::new(0.0f64);
        let hook = |percent: f64| {
            report_progress(&inner_for_hook, &job_id_owned, &high_water, percent)
        };
        inner_for_hook
            .scraper
            .fetch_to_file(&media_url, &dest, &hook)
    })
    .await
    .map_err(|err| JobError::Download(format!("fetch task failed: {err}")))?
}

fn report_progress(
    inner: &Arc<DispatcherInner>,
    job_id: &str,
    high_water: &Mutex<f64>,
    percent: f64,
) -> ProgressSignal {
    if inner.cancellations.is_cancelled(job_id) {
        return ProgressSignal::Abort;
    }
    let mut high_water = high_water.lock();
    if percent > *high_water {
        *high_water = percent;
    }
    inner
        .tracker
        .update_if_active(job_id, JobProgress::downloading(*high_water));
    ProgressSignal::Continue
}

fn ensure_active(inner: &Arc<DispatcherInner>, job_id: &str) -> Result<(), JobError> {
    if inner.cancellations.is_cancelled(job_id) {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}

fn filename_gate(inner: &Arc<DispatcherInner>, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    inner
        .in_flight
        .lock()
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

fn release_gate(inner: &Arc<DispatcherInner>, path: &Path, gate: &Arc<tokio::sync::Mutex<()>>) {
    let mut in_flight = inner.in_flight.lock();
    // Two references mean the map entry and our local clone, so nobody else
    // is waiting and the entry can go.
    if Arc::strong_count(gate) <= 2 {
        in_flight.remove(path);
    }
}

/// Locates the file a successful extractor run produced. The expected path
/// is checked first; postprocessing fallbacks may land on a different
/// extension, so otherwise any `stem.*` sibling qualifies, skipping partial
/// transfers and metadata sidecars, lexicographically first on ties.
fn find_output_file(expected: &Path) -> Option<PathBuf> {
    if expected.is_file() {
        return Some(expected.to_path_buf());
    }
    let dir = expected.parent()?;
    let stem = expected.file_stem()?.to_str()?;
    let prefix = format!("{stem}.");

    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                return false;
            };
            name.starts_with(&prefix)
                && !name.ends_with(".part")
                && !name.ends_with(".json")
                && !name.ends_with(".tmp")
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::Thumbnail;
    use crate::progress::JobStatus;
    use std::io::Write as _;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    /// Scripted extractor: serves fixed metadata and writes a marker file
    /// for each download, optionally failing the first N attempts.
    struct StubExtractor {
        info: Option<MediaInfo>,
        extension: &'static str,
        fail_first: AtomicUsize,
        failure: String,
        downloads: AtomicUsize,
    }

    impl StubExtractor {
        fn with_info(id: &str, title: &str) -> Self {
            Self {
                info: Some(MediaInfo {
                    id: Some(id.to_string()),
                    title: Some(title.to_string()),
                    uploader: Some("uploader".to_string()),
                    thumbnail: None,
                    thumbnails: Vec::new(),
                }),
                extension: "mp4",
                fail_first: AtomicUsize::new(0),
                failure: String::new(),
                downloads: AtomicUsize::new(0),
            }
        }

        fn with_thumbnail(mut self, url: &str) -> Self {
            if let Some(info) = &mut self.info {
                info.thumbnails = vec![Thumbnail {
                    url: Some(url.to_string()),
                }];
            }
            self
        }

        fn failing_first(mut self, count: usize, message: &str) -> Self {
            self.fail_first = AtomicUsize::new(count);
            self.failure = message.to_string();
            self
        }

        fn extension(mut self, ext: &'static str) -> Self {
            self.extension = ext;
            self
        }

        fn download_count(&self) -> usize {
            self.downloads.load(Ordering::SeqCst)
        }
    }

    impl MediaExtractor for StubExtractor {
        fn extract_metadata(&self, _url: &str) -> Result<MediaInfo, JobError> {
            self.info
                .clone()
                .ok_or_else(|| JobError::Extraction("metadata unavailable".to_string()))
        }

        fn download(
            &self,
            _url: &str,
            output_stem: &Path,
            _options: &ExtractionOptions,
            on_progress: crate::progress::ProgressFn<'_>,
        ) -> Result<(), JobError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if on_progress(50.0) == ProgressSignal::Abort {
                return Err(JobError::Cancelled);
            }
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(JobError::Download(self.failure.clone()));
            }
            let path = PathBuf::from(format!(
                "{}.{}",
                output_stem.display(),
                self.extension
            ));
            let mut file = fs::File::create(path).unwrap();
            file.write_all(b"media-bytes").unwrap();
            Ok(())
        }
    }

    /// Extractor whose first attempt reports high progress before failing
    /// retryably, and whose second attempt reports low progress then parks
    /// until the test releases it. Lets the test poll mid-retry.
    struct RetryProgressExtractor {
        info: MediaInfo,
        attempts: AtomicUsize,
        retry_reported: AtomicBool,
        release: AtomicBool,
    }

    impl RetryProgressExtractor {
        fn new(id: &str, title: &str) -> Self {
            Self {
                info: MediaInfo {
                    id: Some(id.to_string()),
                    title: Some(title.to_string()),
                    uploader: None,
                    thumbnail: None,
                    thumbnails: Vec::new(),
                },
                attempts: AtomicUsize::new(0),
                retry_reported: AtomicBool::new(false),
                release: AtomicBool::new(false),
            }
        }
    }

    impl MediaExtractor for RetryProgressExtractor {
        fn extract_metadata(&self, _url: &str) -> Result<MediaInfo, JobError> {
            Ok(self.info.clone())
        }

        fn download(
            &self,
            _url: &str,
            output_stem: &Path,
            _options: &ExtractionOptions,
            on_progress: crate::progress::ProgressFn<'_>,
        ) -> Result<(), JobError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                on_progress(80.0);
                return Err(JobError::Download(
                    "ERROR: no video formats found".to_string(),
                ));
            }
            on_progress(10.0);
            self.retry_reported.store(true, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            let path = PathBuf::from(format!("{}.mp4", output_stem.display()));
            fs::write(path, b"media-bytes").unwrap();
            Ok(())
        }
    }

    /// Scripted scraper: optional fixed media URLs, writes fixed bytes.
    #[derive(Default)]
    struct StubScraper {
        image_url: Option<String>,
        video_url: Option<String>,
        fetches: AtomicUsize,
    }

    impl PageScraper for StubScraper {
        fn scrape_image_url(&self, _page_url: &str) -> Option<String> {
            self.image_url.clone()
        }

        fn scrape_video_url(&self, _page_url: &str) -> Option<String> {
            self.video_url.clone()
        }

        fn fetch_to_file(
            &self,
            _media_url: &str,
            dest: &Path,
            on_progress: crate::progress::ProgressFn<'_>,
        ) -> Result<u64, JobError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if on_progress(100.0) == ProgressSignal::Abort {
                return Err(JobError::Cancelled);
            }
            fs::write(dest, b"scraped").unwrap();
            Ok(7)
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        extractor: Arc<StubExtractor>,
        scraper: Arc<StubScraper>,
        dir: TempDir,
    }

    fn harness(extractor: StubExtractor, scraper: StubScraper) -> Harness {
        let dir = tempdir().unwrap();
        let extractor = Arc::new(extractor);
        let scraper = Arc::new(scraper);
        let dispatcher = Dispatcher::new(
            extractor.clone(),
            scraper.clone(),
            dir.path().to_path_buf(),
            AuditLog::new(dir.path().join("log.txt")),
            true,
            true,
        );
        Harness {
            dispatcher,
            extractor,
            scraper,
            dir,
        }
    }

    async fn wait_terminal(dispatcher: &Dispatcher, job_id: &str) -> JobProgress {
        for _ in 0..200 {
            let snapshot = dispatcher.poll(job_id);
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn video_job_lands_deterministic_file_and_sidecar() {
        let h = harness(StubExtractor::with_info("abc123", "Clip"), StubScraper::default());
        let request = JobRequest::new("https://www.youtube.com/watch?v=abc123", MediaFormat::Video);
        let job_id = h.dispatcher.submit(request).unwrap();

        let done = wait_terminal(&h.dispatcher, &job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.filename.as_deref(), Some("video_abc123_Clip_720.mp4"));

        let file = h.dir.path().join("video_abc123_Clip_720.mp4");
        assert!(file.is_file());
        let raw = fs::read_to_string(sidecar::path_for(&file)).unwrap();
        let record: MediaSidecar = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.id, "abc123");
        assert_eq!(record.quality_requested, "720");
        assert_eq!(record.method, "extractor");
    }

    #[tokio::test]
    async fn resubmission_skips_when_file_already_exists() {
        let h = harness(StubExtractor::with_info("abc123", "Clip"), StubScraper::default());
        let url = "https://www.youtube.com/watch?v=abc123";

        let first = h
            .dispatcher
            .submit(JobRequest::new(url, MediaFormat::Video))
            .unwrap();
        wait_terminal(&h.dispatcher, &first).await;

        let second = h
            .dispatcher
            .submit(JobRequest::new(url, MediaFormat::Video))
            .unwrap();
        let done = wait_terminal(&h.dispatcher, &second).await;

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(h.extractor.download_count(), 1);
    }

    #[tokio::test]
    async fn forced_redownload_clears_and_refetches() {
        let h = harness(StubExtractor::with_info("abc123", "Clip"), StubScraper::default());
        let url = "https://www.youtube.com/watch?v=abc123";

        let first = h
            .dispatcher
            .submit(JobRequest::new(url, MediaFormat::Video))
            .unwrap();
        wait_terminal(&h.dispatcher, &first).await;

        let second = h
            .dispatcher
            .submit(JobRequest::new(url, MediaFormat::Video).with_honor_existing(false))
            .unwrap();
        let done = wait_terminal(&h.dispatcher, &second).await;

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(h.extractor.download_count(), 2);
    }

    #[tokio::test]
    async fn audio_job_sanitizes_title_into_filename() {
        let h = harness(
            StubExtractor::with_info("abc123", "Song <Title>!!").extension("mp3"),
            StubScraper::default(),
        );
        let request = JobRequest::new("https://www.youtube.com/watch?v=abc123", MediaFormat::Audio);
        let job_id = h.dispatcher.submit(request).unwrap();

        let done = wait_terminal(&h.dispatcher, &job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.filename.as_deref(), Some("audio_abc123_Song_Title.mp3"));
        assert!(h.dir.path().join("audio_abc123_Song_Title.mp3").is_file());
    }

    #[tokio::test]
    async fn retryable_failure_gets_exactly_one_relaxed_retry() {
        let h = harness(
            StubExtractor::with_info("abc123", "Clip")
                .failing_first(1, "ERROR: no video formats found"),
            StubScraper::default(),
        );
        let request = JobRequest::new("https://example.com/watch?v=abc123", MediaFormat::Video);
        let job_id = h.dispatcher.submit(request).unwrap();

        let done = wait_terminal(&h.dispatcher, &job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(h.extractor.download_count(), 2);

        let raw = fs::read_to_string(sidecar::path_for(
            &h.dir.path().join("video_abc123_Clip_720.mp4"),
        ))
        .unwrap();
        let record: MediaSidecar = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.method, "extractor-relaxed");
    }

    #[tokio::test]
    async fn relaxed_retry_never_regresses_reported_progress() {
        let dir = tempdir().unwrap();
        let extractor = Arc::new(RetryProgressExtractor::new("abc123", "Clip"));
        let dispatcher = Dispatcher::new(
            extractor.clone(),
            Arc::new(StubScraper::default()),
            dir.path().to_path_buf(),
            AuditLog::new(dir.path().join("log.txt")),
            true,
            true,
        );
        let request = JobRequest::new("https://example.com/watch?v=abc123", MediaFormat::Video);
        let job_id = dispatcher.submit(request).unwrap();

        for _ in 0..200 {
            if extractor.retry_reported.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(extractor.retry_reported.load(Ordering::SeqCst));

        // First attempt peaked at 80 before its retryable failure; the retry
        // just reported 10. Polling must still show the high-water mark.
        let mid = dispatcher.poll(&job_id);
        assert_eq!(mid.status, JobStatus::Downloading);
        assert_eq!(mid.progress, 80.0);

        extractor.release.store(true, Ordering::SeqCst);
        let done = wait_terminal(&dispatcher, &job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100.0);
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let h = harness(
            StubExtractor::with_info("abc123", "Clip").failing_first(2, "ERROR: HTTP 403"),
            StubScraper::default(),
        );
        let request = JobRequest::new("https://example.com/watch?v=abc123", MediaFormat::Video);
        let job_id = h.dispatcher.submit(request).unwrap();

        let done = wait_terminal(&h.dispatcher, &job_id).await;
        assert_eq!(done.status, JobStatus::Error);
        assert!(done.error.unwrap().contains("HTTP 403"));
        assert_eq!(h.extractor.download_count(), 1);
    }

    #[tokio::test]
    async fn photo_prefers_thumbnail_over_page_scrape() {
        let h = harness(
            StubExtractor::with_info("pic1", "Poster")
                .with_thumbnail("https://i.example.com/max.jpg"),
            StubScraper {
                image_url: Some("https://cdn.example.com/should-not-win.jpg".to_string()),
                ..StubScraper::default()
            },
        );
        let request = JobRequest::new("https://example.com/p/1", MediaFormat::Photo);
        let job_id = h.dispatcher.submit(request).unwrap();

        let done = wait_terminal(&h.dispatcher, &job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.filename.as_deref(), Some("photo_pic1_Poster.jpg"));
        assert_eq!(h.extractor.download_count(), 0);

        let raw = fs::read_to_string(sidecar::path_for(
            &h.dir.path().join("photo_pic1_Poster.jpg"),
        ))
        .unwrap();
        let record: MediaSidecar = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.method, "thumbnail");
    }

    #[tokio::test]
    async fn photo_falls_back_to_page_scrape_on_supported_hosts() {
        let h = harness(
            StubExtractor::with_info("pin9", "Board Pin"),
            StubScraper {
                image_url: Some("https://i.pinimg.com/originals/a.jpg".to_string()),
                ..StubScraper::default()
            },
        );
        let request = JobRequest::new("https://www.pinterest.com/pin/9/", MediaFormat::Photo);
        let job_id = h.dispatcher.submit(request).unwrap();

        let done = wait_terminal(&h.dispatcher, &job_id).await;
        assert_eq!(done.status, JobStatus::Completed);

        let file = h.dir.path().join("photo_pin9_Board_Pin.jpg");
        let raw = fs::read_to_string(sidecar::path_for(&file)).unwrap();
        let record: ScrapeSidecar = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.method, "page-scrape");
        assert_eq!(
            record.source_image.as_deref(),
            Some("https://i.pinimg.com/originals/a.jpg")
        );
    }

    #[tokio::test]
    async fn photo_without_any_source_reports_no_image() {
        let h = harness(StubExtractor::with_info("x", "No Art"), StubScraper::default());
        let request = JobRequest::new("https://example.com/p/2", MediaFormat::Photo);
        let job_id = h.dispatcher.submit(request).unwrap();

        let done = wait_terminal(&h.dispatcher, &job_id).await;
        assert_eq!(done.status, JobStatus::Error);
        assert!(done.error.unwrap().contains("no image URL found"));
    }

    #[tokio::test]
    async fn scraped_video_short_circuits_the_extractor() {
        let h = harness(
            StubExtractor::with_info("pin7", "Reel"),
            StubScraper {
                video_url: Some("https://v.pinimg.com/r.mp4".to_string()),
                ..StubScraper::default()
            },
        );
        let request = JobRequest::new("https://www.pinterest.com/pin/7/", MediaFormat::Video);
        let job_id = h.dispatcher.submit(request).unwrap();

        let done = wait_terminal(&h.dispatcher, &job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(h.extractor.download_count(), 0);
        assert_eq!(h.scraper.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_before_completion_wins_over_later_writes() {
        let h = harness(StubExtractor::with_info("abc123", "Clip"), StubScraper::default());
        let request = JobRequest::new("https://example.com/watch?v=abc123", MediaFormat::Video);
        let job_id = h.dispatcher.submit(request).unwrap();
        h.dispatcher.cancel(&job_id);

        let done = wait_terminal(&h.dispatcher, &job_id).await;
        assert_eq!(done.status, JobStatus::Error);
        assert!(done.error.unwrap().contains("cancelled by user"));
    }

    #[tokio::test]
    async fn cancel_after_completion_does_not_disturb_the_record() {
        let h = harness(StubExtractor::with_info("abc123", "Clip"), StubScraper::default());
        let request = JobRequest::new("https://example.com/watch?v=abc123", MediaFormat::Video);
        let job_id = h.dispatcher.submit(request).unwrap();

        wait_terminal(&h.dispatcher, &job_id).await;
        h.dispatcher.cancel(&job_id);

        let snapshot = h.dispatcher.poll(&job_id);
        assert_eq!(snapshot.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn submit_rejects_malformed_urls() {
        let h = harness(StubExtractor::with_info("x", "y"), StubScraper::default());
        let err = h
            .dispatcher
            .submit(JobRequest::new("   ", MediaFormat::Video))
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidRequest(_)));

        let err = h
            .dispatcher
            .submit(JobRequest::new("ftp://example.com/a", MediaFormat::Video))
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn unknown_job_polls_as_waiting() {
        let h = harness(StubExtractor::with_info("x", "y"), StubScraper::default());
        let snapshot = h.dispatcher.poll("job-999");
        assert_eq!(snapshot.status, JobStatus::Waiting);
        assert_eq!(snapshot.progress, 0.0);
    }

    #[test]
    fn find_output_file_prefers_exact_then_sorted_siblings() {
        let dir = tempdir().unwrap();
        let expected = dir.path().join("audio_a_b.mp3");

        fs::write(dir.path().join("audio_a_b.opus"), b"x").unwrap();
        fs::write(dir.path().join("audio_a_b.m4a"), b"x").unwrap();
        fs::write(dir.path().join("audio_a_b.mp3.json"), b"{}").unwrap();
        fs::write(dir.path().join("audio_a_b.mp3.part"), b"x").unwrap();
        fs::write(dir.path().join("audio_a_b.mp3.json.tmp"), b"{}").unwrap();
        assert_eq!(
            find_output_file(&expected),
            Some(dir.path().join("audio_a_b.m4a"))
        );

        fs::write(&expected, b"x").unwrap();
        assert_eq!(find_output_file(&expected), Some(expected));
    }
}
