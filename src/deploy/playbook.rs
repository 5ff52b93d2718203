//! Versioned playbook bundles
//!
//! A bundle is a gzipped tarball with a single top-level directory (the
//! layout GitHub tarballs use). It is unpacked once into
//! `<home>/playbook-<version>` with that directory stripped, and reused by
//! every later deployment of the same version.

use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::info;

use super::DeploymentError;

/// A playbook bundle pinned to one download URL and one local directory
#[derive(Debug, Clone)]
pub struct PlaybookBundle {
    dir: PathBuf,
    url: String,
}

impl PlaybookBundle {
    /// Bundle downloaded from `url` and extracted into `dir`
    pub fn new(dir: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            url: url.into(),
        }
    }

    /// Local bundle directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the bundle is already extracted
    pub fn is_extracted(&self) -> bool {
        self.dir.is_dir()
    }

    /// Download and extract the bundle unless it is already present.
    ///
    /// Returns the bundle directory.
    pub async fn ensure(&self) -> Result<PathBuf, DeploymentError> {
        if self.is_extracted() {
            return Ok(self.dir.clone());
        }

        info!(url = %self.url, dir = %self.dir.display(), "Downloading playbook bundle");
        let archive = download(&self.url).await?;

        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || unpack(&archive, &dir))
            .await
            .map_err(|e| DeploymentError::Bundle(format!("extraction task failed: {}", e)))??;

        info!(dir = %self.dir.display(), "Playbook bundle extracted");
        Ok(self.dir.clone())
    }
}

async fn download(url: &str) -> Result<Vec<u8>, DeploymentError> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| DeploymentError::Bundle(format!("GET {}: {}", url, e)))?
        .error_for_status()
        .map_err(|e| DeploymentError::Bundle(format!("GET {}: {}", url, e)))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| DeploymentError::Bundle(format!("reading {}: {}", url, e)))?;
    Ok(bytes.to_vec())
}

/// Unpack a `.tar.gz` into `target`, stripping a single top-level directory.
///
/// Extraction happens in a sibling temp directory first, so an interrupted
/// unpack never leaves a half-populated `target` that would be reused.
fn unpack(archive: &[u8], target: &Path) -> Result<(), DeploymentError> {
    let bundle_err = |what: &str, e: std::io::Error| {
        DeploymentError::Bundle(format!("{} {}: {}", what, target.display(), e))
    };

    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| bundle_err("creating parent of", e))?;

    let staging = tempfile::Builder::new()
        .prefix(".playbook-")
        .tempdir_in(parent)
        .map_err(|e| bundle_err("staging", e))?;

    tar::Archive::new(GzDecoder::new(archive))
        .unpack(staging.path())
        .map_err(|e| bundle_err("unpacking into", e))?;

    let entries = std::fs::read_dir(staging.path())
        .map_err(|e| bundle_err("reading staged", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| bundle_err("reading staged", e))?;

    match entries.as_slice() {
        [single] if single.path().is_dir() => {
            std::fs::rename(single.path(), target).map_err(|e| bundle_err("moving to", e))?;
        }
        _ => {
            std::fs::create_dir_all(target).map_err(|e| bundle_err("creating", e))?;
            for entry in &entries {
                std::fs::rename(entry.path(), target.join(entry.file_name()))
                    .map_err(|e| bundle_err("moving to", e))?;
            }
        }
    }
    Ok(())
}
