#![forbid(unsafe_code)]

//! Helpers for files living in the asset directory.

use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use tracing::{debug, warn};

/// Joins a relative path onto `root`. Anything other than plain path
/// components (`..`, `.`, absolute roots, drive prefixes) is refused, so the
/// result can never point outside `root`.
pub fn resolve_asset_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let trimmed = relative.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(candidate))
}

/// Removes the named assets, logging instead of failing when a file is
/// missing or cannot be removed. Returns how many files were deleted.
pub async fn remove_assets(root: &Path, names: &[String]) -> usize {
    let mut removed = 0;
    for name in names {
        let name = name.as_str();
        let Some(path) = resolve_asset_path(root, name) else {
            warn!(name, "skipping asset with unsafe path");
            continue;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "asset removed");
                removed += 1;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "asset already missing");
            }
            Err(err) => {
                warn!(path = %path.display(), "could not remove asset: {err}");
            }
        }
    }
    removed
}
