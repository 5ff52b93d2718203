//! Managed known-hosts file
//!
//! Cloud providers recycle floating IPs, so a new node often answers on an
//! address we already hold a (now wrong) host key for. Before trusting a new
//! key, every live entry for that address is moved to `<file>.old` and the
//! freshly scanned key is written in its place. The live file is always
//! rewritten atomically; the archive is append-only.
//!
//! Hashed entries (`|1|salt|hash`) cannot be attributed to an address and are
//! left untouched. stratus writes its own entries unhashed.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::RemoteAccessError;
use crate::atomic::write_atomic;

/// Outcome of a rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    /// Number of stale entries moved to the archive
    pub archived: usize,
    /// Number of fresh entries now live for the address
    pub recorded: usize,
}

/// A known-hosts file owned by stratus
#[derive(Debug, Clone)]
pub struct KnownHostsFile {
    path: PathBuf,
}

impl KnownHostsFile {
    /// Manage the file at `path` (it need not exist yet)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the live file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the archive that receives rotated-out entries
    pub fn archive_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".old");
        PathBuf::from(name)
    }

    fn read_lines(&self) -> Result<Vec<String>, RemoteAccessError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(RemoteAccessError::known_hosts(&self.path, e)),
        }
    }

    /// Live entries for `address`
    pub fn entries_for(&self, address: &str) -> Result<Vec<String>, RemoteAccessError> {
        Ok(self
            .read_lines()?
            .into_iter()
            .filter(|line| entry_matches(line, address))
            .collect())
    }

    /// Archive every live entry for `address` and record `scanned` in its place.
    ///
    /// `scanned` is raw `ssh-keyscan` output; comment lines and entries for
    /// other hosts are ignored. Fails if it contains no key for `address`,
    /// leaving both files untouched.
    pub fn rotate(&self, address: &str, scanned: &str) -> Result<Rotation, RemoteAccessError> {
        let mut fresh = BTreeSet::new();
        for line in scanned.lines().map(str::trim) {
            if entry_matches(line, address) {
                fresh.insert(line.to_string());
            }
        }
        if fresh.is_empty() {
            return Err(RemoteAccessError::KeyScan {
                address: address.to_string(),
                message: "no host keys returned".to_string(),
            });
        }

        let (stale, kept): (Vec<String>, Vec<String>) = self
            .read_lines()?
            .into_iter()
            .partition(|line| entry_matches(line, address));

        let mut content = String::new();
        for line in kept.iter().chain(fresh.iter()) {
            content.push_str(line);
            content.push('\n');
        }
        write_atomic(&self.path, content.as_bytes())
            .map_err(|e| RemoteAccessError::known_hosts(&self.path, e))?;

        // Archive only once the stale entries are no longer live
        if !stale.is_empty() {
            self.append_archive(&stale)?;
            info!(
                address,
                archived = stale.len(),
                archive = %self.archive_path().display(),
                "Archived stale host keys"
            );
        }

        debug!(address, recorded = fresh.len(), "Recorded host keys");
        Ok(Rotation {
            archived: stale.len(),
            recorded: fresh.len(),
        })
    }

    /// Append `lines` to the archive, skipping lines it already holds
    fn append_archive(&self, lines: &[String]) -> Result<(), RemoteAccessError> {
        let archive = self.archive_path();
        let archived: BTreeSet<String> = match std::fs::read_to_string(&archive) {
            Ok(content) => content.lines().map(str::to_string).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(RemoteAccessError::known_hosts(&archive, e)),
        };
        let lines: Vec<&String> = lines.iter().filter(|line| !archived.contains(*line)).collect();
        if lines.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&archive)
            .map_err(|e| RemoteAccessError::known_hosts(&archive, e))?;
        for line in lines {
            writeln!(file, "{}", line).map_err(|e| RemoteAccessError::known_hosts(&archive, e))?;
        }
        Ok(())
    }
}

/// Whether a known-hosts line is a live entry for `address`.
///
/// Matches plain host patterns and the bracketed `[address]:port` form in a
/// comma-separated host list. Negated and wildcard patterns never match.
fn entry_matches(line: &str, address: &str) -> bool {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return false;
    }

    let mut fields = line.split_whitespace();
    let Some(mut hosts) = fields.next() else {
        return false;
    };
    // Skip a leading marker (@cert-authority, @revoked)
    if hosts.starts_with('@') {
        match fields.next() {
            Some(next) => hosts = next,
            None => return false,
        }
    }
    // A host list with no key after it is not an entry
    if fields.next().is_none() {
        return false;
    }

    hosts.split(',').any(|pattern| {
        if pattern == address {
            return true;
        }
        pattern
            .strip_prefix('[')
            .and_then(|rest| rest.split_once("]:"))
            .map(|(host, _port)| host == address)
            .unwrap_or(false)
    })
}
