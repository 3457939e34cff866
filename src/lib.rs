#![forbid(unsafe_code)]

//! Library crate backing the vidpull download server.
//!
//! The interesting machinery lives in [`job`]: a dispatcher that accepts
//! URL+format+quality requests, runs each one as an independent background
//! job, and exposes progress polling and cooperative cancellation. Everything
//! the dispatcher needs from the outside world (the yt-dlp binary, the
//! ffmpeg binary, page scraping for sites yt-dlp resolves poorly) sits
//! behind small traits so the orchestration logic stays testable.

pub mod audit;
pub mod cache;
pub mod config;
pub mod encoder;
pub mod error;
pub mod extractor;
pub mod identity;
pub mod job;
pub mod media;
pub mod options;
pub mod progress;
pub mod scrape;
pub mod security;
pub mod sidecar;
