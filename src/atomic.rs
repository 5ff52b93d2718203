//! Atomic file replacement
//!
//! Shared mutable files (the cluster state file, the known-hosts file) are
//! always rewritten whole: write a temp file next to the target, then rename
//! it over the target. A crash mid-write leaves the old contents intact.

use std::io::Write;
use std::path::Path;

/// Write `content` to `path` atomically using a sibling temp file + rename.
///
/// Creates the parent directory if needed.
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    // Same directory as the target so the rename never crosses filesystems
    let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
    temp_file.write_all(content)?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;

    Ok(())
}
