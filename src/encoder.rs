#![forbid(unsafe_code)]

//! Discovery of the external encoder binary (ffmpeg).
//!
//! Search order: every directory on `PATH`, then a fixed local extraction
//! folder next to the working directory for installs that never touched
//! `PATH`. The returned value is the directory containing the binary because
//! the extractor wants `--ffmpeg-location <dir>` so it can also find the
//! sibling helper tools.

use std::env;
use std::path::{Path, PathBuf};

/// Where a local, non-PATH ffmpeg install is expected to live.
pub const LOCAL_ENCODER_DIR: &str = "ffmpeg-7.1.1-essentials_build/bin";

const BINARY_NAMES: &[&str] = &["ffmpeg", "ffmpeg.exe"];

/// Appended to encoder-related failure messages so users know where to put
/// the binary.
pub fn remediation_hint() -> String {
    format!(
        "ffmpeg appears to be unavailable; install it on PATH or unpack it into {LOCAL_ENCODER_DIR}"
    )
}

/// Returns the directory holding the encoder binary, if one can be found.
pub fn locate_encoder() -> Option<PathBuf> {
    locate_encoder_in(env::var_os("PATH"), Path::new("."))
}

fn locate_encoder_in(path_var: Option<std::ffi::OsString>, base: &Path) -> Option<PathBuf> {
    if let Some(paths) = path_var {
        for dir in env::split_paths(&paths) {
            if dir.as_os_str().is_empty() {
                continue;
            }
            for name in BINARY_NAMES {
                if dir.join(name).is_file() {
                    return Some(dir);
                }
            }
        }
    }

    let local = base.join(LOCAL_ENCODER_DIR);
    for name in BINARY_NAMES {
        if local.join(name).is_file() {
            return Some(local);
        }
    }

    None
}
