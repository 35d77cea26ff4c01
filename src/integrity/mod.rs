//! SHA-256 manifest verification (`SHA256SUMS`) and the audit log.
//!
//! `SHA256SUMS` lines follow coreutils: `<hex digest>  <relative path>`, with
//! an optional `*` before the path for binary mode. Paths are relative to
//! the tree being checked and may not escape it.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{SecurityError, SecurityResult};

pub mod audit;

/// Canonical name of the per-release sums file.
pub const SUMS_FILE: &str = "SHA256SUMS";

/// Compute the SHA-256 hex digest of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the SHA-256 hex digest of a file, streaming its contents.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn sha256_file(path: &Path) -> SecurityResult<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| SecurityError::io("failed to open for hashing", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| SecurityError::io("failed to read for hashing", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(buf.get(..n).unwrap_or_default());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whether `value` is a 64-character lowercase or uppercase hex digest.
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// One line of a sums file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SumsEntry {
    /// Lowercase hex digest.
    pub digest: String,
    /// Path relative to the checked tree.
    pub path: String,
}

/// Parse a sums file.
///
/// Blank lines and `#` comments are skipped; anything else that does not
/// parse is an error naming the line.
///
/// # Errors
///
/// Returns [`SecurityError::Configuration`] on a malformed line or an unsafe
/// path.
pub fn parse_sums(content: &str) -> SecurityResult<Vec<SumsEntry>> {
    let mut entries = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim_end();
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let lineno = idx.saturating_add(1);
        let (digest, rest) = line.split_once(char::is_whitespace).ok_or_else(|| {
            SecurityError::config(format!("malformed sums line {lineno}: {line:?}"))
        })?;
        let path = rest.trim_start();
        let path = path.strip_prefix('*').unwrap_or(path);
        if !is_sha256_hex(digest) {
            return Err(SecurityError::config(format!(
                "malformed digest on sums line {lineno}: {digest:?}"
            )));
        }
        validate_relative_path(path)?;
        entries.push(SumsEntry {
            digest: digest.to_ascii_lowercase(),
            path: path.to_owned(),
        });
    }
    Ok(entries)
}

/// Find the digest recorded for `filename` in a sums file.
///
/// # Errors
///
/// Returns an error if the content is malformed or has no matching entry.
pub fn find_checksum(content: &str, filename: &str) -> SecurityResult<String> {
    parse_sums(content)?
        .into_iter()
        .find(|e| e.path == filename || e.path.strip_prefix("./") == Some(filename))
        .map(|e| e.digest)
        .ok_or_else(|| SecurityError::trust(format!("no checksum recorded for {filename}")))
}

/// Reject absolute paths, `..` components and control characters.
///
/// # Errors
///
/// Returns [`SecurityError::Configuration`] describing the offending path.
pub fn validate_relative_path(path: &str) -> SecurityResult<()> {
    if path.is_empty() {
        return Err(SecurityError::config("empty path in manifest"));
    }
    if path.chars().any(char::is_control) {
        return Err(SecurityError::config(format!(
            "path contains control characters: {path:?}"
        )));
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SecurityError::config(format!(
                    "path escapes the checked tree: {path}"
                )));
            }
        }
    }
    Ok(())
}

/// How a missing sums file is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityPolicy {
    /// Channel of the tree being checked.
    pub channel: Channel,
    /// Downgrade a missing sums file to a warning on dev.
    pub allow_missing_sums_on_dev: bool,
}

impl IntegrityPolicy {
    /// Policy that treats a missing sums file as fatal everywhere.
    pub fn strict(channel: Channel) -> Self {
        Self {
            channel,
            allow_missing_sums_on_dev: false,
        }
    }

    fn tolerates_missing_sums(&self) -> bool {
        self.allow_missing_sums_on_dev && self.channel.is_lenient()
    }
}

/// Outcome of a successful (or tolerated) tree check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityReport {
    /// Every listed file matched.
    Verified {
        /// Number of files checked.
        files: usize,
    },
    /// No sums file, tolerated by policy.
    SumsMissingTolerated,
}

/// Recompute and compare every file listed in `sums_path` under `root`.
///
/// All mismatches and missing files are collected before failing, so the
/// error names every bad artifact at once.
///
/// # Errors
///
/// Returns [`SecurityError::TrustVerification`] on any mismatch or missing
/// file, and [`SecurityError::Configuration`] when the sums file is absent
/// and policy does not tolerate it.
pub fn verify_tree(
    root: &Path,
    sums_path: &Path,
    policy: IntegrityPolicy,
) -> SecurityResult<IntegrityReport> {
    verify_tree_excluding(root, sums_path, policy, &[])
}

/// [`verify_tree`] ignoring sums entries named in `excluded`, for files
/// that sit next to the tree rather than inside it (such as the archive
/// the tree was unpacked from).
///
/// # Errors
///
/// Same as [`verify_tree`].
pub fn verify_tree_excluding(
    root: &Path,
    sums_path: &Path,
    policy: IntegrityPolicy,
    excluded: &[&str],
) -> SecurityResult<IntegrityReport> {
    let content = match std::fs::read_to_string(sums_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if policy.tolerates_missing_sums() {
                warn!(
                    sums = %sums_path.display(),
                    "SHA256SUMS missing; integrity check skipped on dev channel"
                );
                return Ok(IntegrityReport::SumsMissingTolerated);
            }
            return Err(SecurityError::config(format!(
                "{} not found; the release is incomplete, reinstall it",
                sums_path.display()
            )));
        }
        Err(e) => return Err(SecurityError::io("failed to read", sums_path, e)),
    };

    let entries: Vec<SumsEntry> = parse_sums(&content)?
        .into_iter()
        .filter(|e| !excluded.contains(&normalize(&e.path).as_str()))
        .collect();
    let mut failures: Vec<String> = Vec::new();
    for entry in &entries {
        let path: PathBuf = root.join(&entry.path);
        if !path.is_file() {
            failures.push(format!("{}: missing", entry.path));
            continue;
        }
        let actual = sha256_file(&path)?;
        if actual != entry.digest {
            failures.push(format!(
                "{}: expected {}, got {actual}",
                entry.path, entry.digest
            ));
        } else {
            debug!(file = %entry.path, "digest ok");
        }
    }

    if !failures.is_empty() {
        return Err(SecurityError::trust(format!(
            "integrity check failed under {}: {}",
            root.display(),
            failures.join("; ")
        )));
    }

    info!(root = %root.display(), files = entries.len(), "integrity check passed");
    Ok(IntegrityReport::Verified {
        files: entries.len(),
    })
}

/// Files under `root` that `sums_path` does not list.
///
/// Paths are `/`-separated and relative to `root`; anything in `exempt`
/// (exact relative paths) is skipped. Symlinks are reported as files and
/// never followed.
///
/// # Errors
///
/// Returns an error if the sums file or the tree cannot be read.
pub fn unlisted_files(
    root: &Path,
    sums_path: &Path,
    exempt: &[String],
) -> SecurityResult<Vec<String>> {
    let content = std::fs::read_to_string(sums_path)
        .map_err(|e| SecurityError::io("failed to read", sums_path, e))?;
    let listed: BTreeSet<String> = parse_sums(&content)?
        .into_iter()
        .map(|e| normalize(&e.path))
        .collect();

    let mut found = Vec::new();
    collect_files(root, root, &mut found)?;
    let unlisted: Vec<String> = found
        .into_iter()
        .filter(|rel| !listed.contains(rel) && !exempt.contains(rel))
        .collect();
    if !unlisted.is_empty() {
        debug!(root = %root.display(), count = unlisted.len(), "unlisted files found");
    }
    Ok(unlisted)
}

fn normalize(path: &str) -> String {
    Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> SecurityResult<()> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| SecurityError::io("failed to list", dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SecurityError::io("failed to list", dir, e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| SecurityError::io("failed to stat", &path, e))?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        if let Ok(rel) = path.strip_prefix(root) {
            out.push(normalize(&rel.to_string_lossy()));
        }
    }
    Ok(())
}
