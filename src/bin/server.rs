#![forbid(unsafe_code)]

//! HTTP frontend for the vidpull download engine.
//!
//! The API mirrors the polling workflow the engine is built around: submit a
//! URL, poll the returned job id, cancel if needed, fetch the finished file.
//! All heavy lifting lives in the library; handlers stay thin.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::Deserialize;
use serde_json::json;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use vidpull::audit::AuditLog;
use vidpull::config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config};
use vidpull::encoder;
use vidpull::extractor::YtDlp;
use vidpull::job::Dispatcher;
use vidpull::media::{JobRequest, MediaFormat};
use vidpull::scrape::HttpScraper;
use vidpull::security::{ensure_not_root, is_safe_path_segment};

const EXTRACTOR_BINARY: &str = "yt-dlp";

#[derive(Debug, Clone)]
struct ServerArgs {
    config: RuntimeConfig,
    listen_host: IpAddr,
}

impl ServerArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--downloads-root=") {
                overrides.downloads_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--audit-log=") {
                overrides.audit_log = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                overrides.vidpull_port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                overrides.vidpull_host = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env=") {
                overrides.env_path = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--downloads-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--downloads-root requires a value"))?;
                    overrides.downloads_root = Some(PathBuf::from(value));
                }
                "--audit-log" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--audit-log requires a value"))?;
                    overrides.audit_log = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    overrides.vidpull_port = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    overrides.vidpull_host = Some(value);
                }
                "--env" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env requires a value"))?;
                    overrides.env_path = Some(PathBuf::from(value));
                }
                "--no-honor-existing" => {
                    overrides.honor_existing = Some(false);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let config = resolve_runtime_config(overrides)?;
        let listen_host = parse_host_arg(&config.vidpull_host)?;
        Ok(Self {
            config,
            listen_host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/VIDPULL_HOST")
}

#[derive(Clone)]
struct AppState {
    dispatcher: Dispatcher,
    downloads_root: Arc<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let ServerArgs {
        config,
        listen_host,
    } = ServerArgs::parse()?;

    ensure_not_root("server")?;

    std::fs::create_dir_all(&config.downloads_root)
        .with_context(|| format!("creating {}", config.downloads_root.display()))?;

    let encoder_dir = encoder::locate_encoder();
    if encoder_dir.is_none() {
        eprintln!("Warning: {}", encoder::remediation_hint());
    }
    let encoder_available = encoder_dir.is_some();

    let extractor = Arc::new(YtDlp::new(EXTRACTOR_BINARY, encoder_dir));
    let scraper = Arc::new(HttpScraper::new());
    let audit = AuditLog::new(config.audit_log.clone());
    let dispatcher = Dispatcher::new(
        extractor,
        scraper,
        config.downloads_root.clone(),
        audit,
        config.honor_existing,
        encoder_available,
    );

    let state = AppState {
        dispatcher,
        downloads_root: Arc::new(config.downloads_root.clone()),
    };

    let app = Router::new()
        .route("/download", post(submit_download))
        .route("/progress/{id}", get(get_progress))
        .route("/cancel/{id}", post(cancel_download))
        .route("/file/{filename}", get(fetch_file))
        .with_state(state);

    let addr = SocketAddr::new(listen_host, config.vidpull_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("vidpull listening on http://{}", addr);
    println!("downloads root: {}", config.downloads_root.display());

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("running server")?;

    Ok(())
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

#[derive(Debug, Deserialize)]
struct DownloadBody {
    url: Option<String>,
    format: Option<String>,
    quality: Option<String>,
    honor_existing: Option<bool>,
}

async fn submit_download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<DownloadBody>,
) -> Response {
    let format = match MediaFormat::parse(body.format.as_deref()) {
        Ok(format) => format,
        Err(err) => return submit_rejection(&err.to_string()),
    };

    let mut request = JobRequest::new(body.url.unwrap_or_default(), format)
        .with_client(client_identity(&headers, addr));
    if let Some(quality) = body.quality {
        request = request.with_quality(quality);
    }
    if let Some(honor) = body.honor_existing {
        request = request.with_honor_existing(honor);
    }

    match state.dispatcher.submit(request) {
        Ok(job_id) => Json(json!({
            "success": true,
            "download_id": job_id,
        }))
        .into_response(),
        Err(err) => submit_rejection(&err.to_string()),
    }
}

fn submit_rejection(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "success": false,
            "error": message,
        })),
    )
        .into_response()
}

/// Submitting client for audit lines: the first forwarded address when the
/// server sits behind a proxy, else the peer address.
fn client_identity(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

async fn get_progress(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    Json(state.dispatcher.poll(&id)).into_response()
}

async fn cancel_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> StatusCode {
    state.dispatcher.cancel(&id);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    download: Option<String>,
}

async fn fetch_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Response {
    if !is_safe_path_segment(&filename) {
        return not_found();
    }

    let as_attachment = matches!(
        query.download.as_deref().map(str::trim),
        Some("true") | Some("1")
    );
    let path = state.downloads_root.join(&filename);
    let mut response = match stream_file(path, Some(&headers)).await {
        Some(response) => response,
        None => return not_found(),
    };

    if as_attachment
        && let Ok(value) = format!("attachment; filename=\"{filename}\"").parse()
    {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "file not found" })),
    )
        .into_response()
}

/// Streams a local file, honoring a single `bytes` range when present.
async fn stream_file(path: PathBuf, headers: Option<&HeaderMap>) -> Option<Response> {
    let mut file = File::open(&path).await.ok()?;
    let metadata = file.metadata().await.ok()?;
    let size = metadata.len();

    let guessed = MimeGuess::from_path(&path).first();
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes */{}", size).parse().ok()?,
            );
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start)).await.ok()?;
            let stream = ReaderStream::new(file.take(length));
            let body = Body::from_stream(stream);
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, size).parse().ok()?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, length.to_string().parse().ok()?);
            response
        }
    } else {
        let stream = ReaderStream::new(file);
        Body::from_stream(stream).into_response()
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, "bytes".parse().ok()?);
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Some(response)
}

fn parse_range_header(value: &header::HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?;
    let value = value.trim();
    let mut parts = value.split('=');
    let unit = parts.next()?.trim();
    if unit != "bytes" {
        return None;
    }
    let range = parts.next()?.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
