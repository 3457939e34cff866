#![forbid(unsafe_code)]

//! Process and request hygiene for the vidpull server.

use std::path::{Component, Path};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the server is started as root. Downloads land wherever
/// the extractor writes them, so an unprivileged user keeps mistakes inside
/// the downloads root instead of system directories.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// True when a client-supplied filename is a single plain path segment that
/// cannot escape the downloads root.
pub fn is_safe_path_segment(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
