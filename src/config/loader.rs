// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{Manifest, RawManifest};
use crate::errors::Result;

/// Read a manifest and deserialize it into a [`RawManifest`].
///
/// Only TOML parsing happens here; no semantic validation. Use
/// [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawManifest> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let manifest: RawManifest = toml::from_str(&contents)?;
    debug!(path = %path.display(), tasks = manifest.task.len(), "manifest parsed");

    Ok(manifest)
}

/// Read a manifest and run every check in [`validate`](crate::config::validate):
///
/// - at least one task,
/// - sane `[scheduler]` values,
/// - known `after` references and no self dependency,
/// - no dependency cycle.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Manifest> {
    let raw = load_from_path(&path)?;
    Manifest::try_from(raw)
}

/// `Dagsched.toml` in the current working directory.
pub fn default_manifest_path() -> PathBuf {
    PathBuf::from("Dagsched.toml")
}
