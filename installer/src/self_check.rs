//! Installer self-integrity gate.
//!
//! The release pipeline writes the installer's own SHA-256 into a slot
//! compiled into the binary. The hash is taken with every line that
//! contains [`MARKER`] left out, so writing the value into the slot does
//! not change the value. At startup the running executable is hashed the
//! same way and compared before anything privileged happens.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use containai::error::{SecurityError, SecurityResult};
use containai::integrity::is_sha256_hex;
use containai::profiles::write_atomic;

/// Marker preceding the embedded digest.
pub const MARKER: &str = "CONTAINAI_INSTALLER_SHA256=";

/// Slot value before injection.
pub const PLACEHOLDER: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Slot compiled into the binary. The surrounding newlines make it a line
/// of its own so redaction never swallows neighbouring data.
static EMBEDDED_SLOT: &str =
    "\nCONTAINAI_INSTALLER_SHA256=0000000000000000000000000000000000000000000000000000000000000000\n";

const DIGEST_LEN: usize = 64;

/// Verifies that the installer has not been modified.
pub trait SelfIntegrity {
    /// Check the executable.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::TrustVerification`] on mismatch or when no
    /// digest was ever injected.
    fn verify(&self) -> SecurityResult<()>;
}

/// The running executable against its compiled-in digest.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunningExecutable;

impl SelfIntegrity for RunningExecutable {
    fn verify(&self) -> SecurityResult<()> {
        let exe = std::env::current_exe()
            .map_err(|e| SecurityError::io("failed to locate", Path::new("current executable"), e))?;
        verify_executable(&exe, &embedded_digest())
    }
}

/// An executable on disk against an explicit digest.
#[derive(Debug, Clone)]
pub struct ExecutableAt {
    /// Executable to hash.
    pub path: PathBuf,
    /// Expected redacted digest.
    pub expected: String,
}

impl SelfIntegrity for ExecutableAt {
    fn verify(&self) -> SecurityResult<()> {
        verify_executable(&self.path, &self.expected)
    }
}

/// Digest embedded in this binary (the placeholder until injected).
pub fn embedded_digest() -> String {
    // Read through black_box so the comparison uses the bytes in the file,
    // not a value the compiler folded in.
    let slot: &str = std::hint::black_box(EMBEDDED_SLOT);
    read_slot(slot.as_bytes()).unwrap_or_else(|| PLACEHOLDER.to_owned())
}

/// SHA-256 over `data` with every marker-bearing line removed.
pub fn redacted_sha256(data: &[u8]) -> String {
    let marker = MARKER.as_bytes();
    let mut hasher = Sha256::new();
    for line in data.split_inclusive(|b| *b == b'\n') {
        if !contains(line, marker) {
            hasher.update(line);
        }
    }
    hex::encode(hasher.finalize())
}

/// Hash `path` with redaction and compare against `expected`.
///
/// # Errors
///
/// Refuses the placeholder, a malformed digest, or a mismatch.
pub fn verify_executable(path: &Path, expected: &str) -> SecurityResult<()> {
    if expected == PLACEHOLDER {
        return Err(SecurityError::trust(
            "installer carries no embedded self-hash; use an official release build",
        ));
    }
    if !is_sha256_hex(expected) {
        return Err(SecurityError::trust(format!(
            "embedded self-hash is malformed: {expected:?}"
        )));
    }
    let data = std::fs::read(path).map_err(|e| SecurityError::io("failed to read", path, e))?;
    let actual = redacted_sha256(&data);
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(SecurityError::trust(format!(
            "installer {} has been modified: expected {expected}, got {actual}; \
             download a fresh copy",
            path.display()
        )));
    }
    info!(path = %path.display(), "installer self-integrity verified");
    Ok(())
}

/// Write the redacted digest of the executable at `path` into its slot.
///
/// Returns the injected digest.
///
/// # Errors
///
/// Fails when the file has no slot or cannot be rewritten.
pub fn inject_self_hash(path: &Path) -> SecurityResult<String> {
    let mut data = std::fs::read(path).map_err(|e| SecurityError::io("failed to read", path, e))?;
    let digest = redacted_sha256(&data);
    let slots = slot_offsets(&data);
    if slots.is_empty() {
        return Err(SecurityError::config(format!(
            "{} has no {MARKER} slot",
            path.display()
        )));
    }
    for start in &slots {
        let end = start
            .checked_add(DIGEST_LEN)
            .ok_or_else(|| SecurityError::config("slot offset overflow"))?;
        if let Some(window) = data.get_mut(*start..end) {
            window.copy_from_slice(digest.as_bytes());
        }
    }

    let permissions = std::fs::metadata(path)
        .map_err(|e| SecurityError::io("failed to stat", path, e))?
        .permissions();
    write_atomic(path, &data)?;
    std::fs::set_permissions(path, permissions)
        .map_err(|e| SecurityError::io("failed to restore permissions on", path, e))?;
    debug!(path = %path.display(), slots = slots.len(), "injected self-hash");
    Ok(digest)
}

/// Digest stored in the first slot of `data`, if any.
pub fn read_slot(data: &[u8]) -> Option<String> {
    let start = *slot_offsets(data).first()?;
    let end = start.checked_add(DIGEST_LEN)?;
    let digest = data.get(start..end)?;
    std::str::from_utf8(digest).ok().map(str::to_owned)
}

/// Offsets of the digest bytes following each `MARKER` + 64 hex chars.
fn slot_offsets(data: &[u8]) -> Vec<usize> {
    let marker = MARKER.as_bytes();
    let mut offsets = Vec::new();
    for (at, window) in data.windows(marker.len()).enumerate() {
        if window != marker {
            continue;
        }
        let Some(start) = at.checked_add(marker.len()) else {
            continue;
        };
        let Some(end) = start.checked_add(DIGEST_LEN) else {
            continue;
        };
        if data
            .get(start..end)
            .is_some_and(|d| d.iter().all(u8::is_ascii_hexdigit))
        {
            offsets.push(start);
        }
    }
    offsets
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
